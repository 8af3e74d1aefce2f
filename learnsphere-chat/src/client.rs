use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{
        ChatMessage, ChatPayload, ClientEvent, Sender, ServerEvent, decode_server_event, encode,
    },
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut writer, mut reader) = establish_connection(&args).await?;
    send_event(&mut writer, &ClientEvent::JoinRoom(args.room.clone())).await?;
    write_stdout(&format!("*** joined {} as {}", args.room, args.name)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&args, &mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(SocketWriter, SocketReader)> {
    let (socket, _response) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(socket.split())
}

async fn send_event(writer: &mut SocketWriter, event: &ClientEvent) -> Result<()> {
    let text = encode(event)?;
    writer
        .send(Message::text(text))
        .await
        .context("failed to send event")?;
    Ok(())
}

async fn run_client_loop(
    args: &ClientArgs,
    reader: &mut SocketReader,
    writer: &mut SocketWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        select! {
            frame = reader.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            // Partial lines survive cancellation, so only clear once a line is handled.
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, args, writer).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            match decode_server_event(&text) {
                Ok(event) => render_server_event(event).await?,
                Err(error) => warn!(?error, "ignoring unexpected server frame"),
            }
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(error)) => Err(error).context("websocket read failed"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    args: &ClientArgs,
    writer: &mut SocketWriter,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        send_event(writer, &ClientEvent::LeaveRoom(args.room.clone())).await?;
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    send_event(writer, &ClientEvent::SendMessage(outgoing(args, text))).await?;
    Ok(true)
}

fn outgoing(args: &ClientArgs, text: &str) -> ChatPayload {
    ChatMessage {
        room_id: args.room.clone(),
        message: text.to_string(),
        sender: Sender {
            id: args.user_id.clone(),
            name: args.name.clone(),
            avatar: args.avatar.clone(),
        },
    }
    .into()
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut SocketWriter) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close websocket cleanly");
    }
}

fn render_line(event: &ServerEvent) -> String {
    match event {
        ServerEvent::ReceiveMessage(payload) => {
            let chat = &payload.chat;
            format!("[{}] <{}> {}", chat.room_id, chat.sender.name, chat.message)
        }
    }
}

async fn render_server_event(event: ServerEvent) -> io::Result<()> {
    write_stdout(&render_line(&event)).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
