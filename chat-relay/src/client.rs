use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{Message, User, read_message, write_message},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected as {}", args.username)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&args, &mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    args: &ClientArgs,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            relay_message = read_message::<_, Message>(reader) => {
                if !handle_relay_message(relay_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(args, bytes_read, input, writer).await? {
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

async fn handle_relay_message(message: io::Result<Option<Message>>) -> Result<bool> {
    match message? {
        Some(message) => {
            write_stdout(&render(&message)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    args: &ClientArgs,
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let Some((recipient, body)) = parse_line(text, &args.to) else {
        return Ok(true);
    };
    let message = Message::new(User::new(&args.username), User::new(recipient), body);
    write_message(writer, &message).await?;
    Ok(true)
}

/// Splits an input line into recipient and body. `@bob hi` goes to `bob`,
/// anything else to `default_recipient`. Returns `None` when there is no body.
fn parse_line<'a>(line: &'a str, default_recipient: &'a str) -> Option<(&'a str, &'a str)> {
    let (recipient, body) = match line.strip_prefix('@') {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((name, body)) => (name, body.trim_start()),
            None => (rest, ""),
        },
        None => (default_recipient, line),
    };

    if recipient.is_empty() || body.is_empty() {
        return None;
    }
    Some((recipient, body))
}

fn render(message: &Message) -> String {
    format!("<{}> {}", message.sender.name, message.body)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
