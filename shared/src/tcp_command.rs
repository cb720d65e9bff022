use core::error::Error;
use std::str::from_utf8;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    received_tcp_command::ReceivedTcpCommand, tcp_command_id::TcpCommandId,
    tcp_command_payload_type::TcpCommandPayloadType,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TcpCommand {
    Simple(TcpCommandId),
    String(TcpCommandId, String),
    StringList(TcpCommandId, Vec<String>),
    Bytes(TcpCommandId, Vec<u8>),
}

impl TcpCommand {
    pub fn id(&self) -> TcpCommandId {
        match self {
            TcpCommand::Simple(id)
            | TcpCommand::String(id, _)
            | TcpCommand::StringList(id, _)
            | TcpCommand::Bytes(id, _) => *id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        if self.id().get_payload_type() != self.payload_type() {
            return Err(format!("{:?} does not carry a {:?} payload", self.id(), self.payload_type()).into());
        }

        match &self {
            TcpCommand::Simple(id) => Ok(vec![id.to_byte()]),
            TcpCommand::String(id, payload) => {
                if payload.len() > u8::MAX as usize {
                    return Err("String payload too large".into());
                }

                let mut bytes = vec![id.to_byte(), payload.len() as u8];
                bytes.extend(payload.as_bytes());

                Ok(bytes)
            }
            TcpCommand::StringList(id, payload) => {
                if payload.len() > u8::MAX as usize {
                    return Err("StringList payload too large".into());
                }

                let mut bytes = vec![id.to_byte(), payload.len() as u8];

                for str in payload {
                    if str.len() > u8::MAX as usize {
                        return Err("String in StringList payload too large".into());
                    }

                    bytes.push(str.len() as u8);
                    bytes.extend(str.as_bytes());
                }

                Ok(bytes)
            }
            TcpCommand::Bytes(id, payload) => {
                if payload.len() > u16::MAX as usize {
                    return Err("Bytes payload too large".into());
                }

                let mut bytes = vec![id.to_byte()];
                bytes.extend((payload.len() as u16).to_be_bytes());
                bytes.extend(payload);

                Ok(bytes)
            }
        }
    }

    fn payload_type(&self) -> TcpCommandPayloadType {
        match self {
            TcpCommand::Simple(_) => TcpCommandPayloadType::Simple,
            TcpCommand::String(..) => TcpCommandPayloadType::String,
            TcpCommand::StringList(..) => TcpCommandPayloadType::StringList,
            TcpCommand::Bytes(..) => TcpCommandPayloadType::Bytes,
        }
    }

    pub async fn write_to_stream<W>(
        &self,
        stream: &mut W,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode()?;
        stream.write_all(&bytes).await?;

        Ok(())
    }

    /// Reads one command. Not cancel-safe: callers that race it against other
    /// futures must run it on a dedicated task.
    pub async fn read_from_stream<R>(
        stream: &mut R,
    ) -> Result<ReceivedTcpCommand, Box<dyn Error + Send + Sync>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0; 1];

        let first_byte = match stream.read(&mut buf).await {
            Ok(0) => return Ok(ReceivedTcpCommand::EOF),
            Ok(_) => buf[0],
            Err(e) => return Err(e.into()),
        };

        let command_id = TcpCommandId::from_byte(first_byte)?;

        match command_id.get_payload_type() {
            TcpCommandPayloadType::Simple => {
                Ok(ReceivedTcpCommand::Command(TcpCommand::Simple(command_id)))
            }
            TcpCommandPayloadType::String => {
                let payload_len = stream.read_u8().await? as usize;

                let mut payload_buf = vec![0; payload_len];
                stream.read_exact(&mut payload_buf).await?;
                let payload = from_utf8(&payload_buf)?.to_string();

                Ok(ReceivedTcpCommand::Command(TcpCommand::String(
                    command_id, payload,
                )))
            }
            TcpCommandPayloadType::StringList => {
                let list_len = stream.read_u8().await? as usize;

                let mut result = Vec::with_capacity(list_len);

                for _ in 0..list_len {
                    let str_len = stream.read_u8().await? as usize;

                    let mut str_buf = vec![0; str_len];
                    stream.read_exact(&mut str_buf).await?;
                    let string = from_utf8(&str_buf)?.to_string();

                    result.push(string);
                }

                Ok(ReceivedTcpCommand::Command(TcpCommand::StringList(
                    command_id, result,
                )))
            }
            TcpCommandPayloadType::Bytes => {
                let payload_len = stream.read_u16().await? as usize;

                let mut payload = vec![0; payload_len];
                stream.read_exact(&mut payload).await?;

                Ok(ReceivedTcpCommand::Command(TcpCommand::Bytes(
                    command_id, payload,
                )))
            }
        }
    }
}
