use shared::message::{ClientMessage, ServerMessage};
use shared::received_tcp_command::ReceivedTcpCommand;
use shared::tcp_command::TcpCommand;
use shared::tcp_command_id::TcpCommandId;
use shared::types::{
    MemberState, Position, PresenceChange, PresenceDelta, RoomBounds, RoomSnapshot, UserId,
    UserPresence,
};
use tokio::io::AsyncWriteExt;

fn presence(raw: &str, x: f64, y: f64) -> UserPresence {
    UserPresence::new(UserId::parse(raw).unwrap(), raw, Position::new(x, y))
}

#[tokio::test]
async fn commands_survive_a_stream_back_to_back() {
    let (mut writer, mut reader) = tokio::io::duplex(4096);

    let snapshot = RoomSnapshot {
        version: 7,
        bounds: RoomBounds::new(800.0, 600.0),
        members: vec![
            MemberState { presence: presence("alice", 10.0, 20.0), seq: 3 },
            MemberState { presence: presence("bob", 30.5, 40.25), seq: 1 },
        ],
    };
    let delta = PresenceDelta {
        version: 8,
        change: PresenceChange::Moved {
            user: UserId::parse("bob").unwrap(),
            seq: 2,
            position: Position::new(31.0, 41.0),
        },
    };

    ServerMessage::Snapshot(snapshot.clone())
        .into_command()
        .write_to_stream(&mut writer)
        .await
        .unwrap();
    ServerMessage::Delta(delta.clone())
        .into_command()
        .write_to_stream(&mut writer)
        .await
        .unwrap();
    ServerMessage::RoomList(vec!["lobby".into(), "design".into()])
        .into_command()
        .write_to_stream(&mut writer)
        .await
        .unwrap();
    drop(writer);

    let mut received = Vec::new();
    loop {
        match TcpCommand::read_from_stream(&mut reader).await.unwrap() {
            ReceivedTcpCommand::EOF => break,
            ReceivedTcpCommand::Command(command) => {
                received.push(ServerMessage::from_command(command).unwrap())
            }
        }
    }

    assert_eq!(
        received,
        vec![
            ServerMessage::Snapshot(snapshot),
            ServerMessage::Delta(delta),
            ServerMessage::RoomList(vec!["lobby".into(), "design".into()]),
        ]
    );
}

#[tokio::test]
async fn unknown_command_byte_is_an_error() {
    let (mut writer, mut reader) = tokio::io::duplex(64);
    writer.write_all(&[0]).await.unwrap();

    assert!(TcpCommand::read_from_stream(&mut reader).await.is_err());
}

#[test]
fn payload_shape_must_match_the_command_id() {
    let wrong = TcpCommand::Simple(TcpCommandId::MoveTo);
    assert!(wrong.encode().is_err());

    let hello = ClientMessage::Hello {
        room: "lobby".into(),
        presence: presence("carol", 1.0, 2.0),
    }
    .into_command();
    assert_eq!(hello.id(), TcpCommandId::HelloFromClient);
    assert!(hello.encode().is_ok());
}
