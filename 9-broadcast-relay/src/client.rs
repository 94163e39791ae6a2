use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{read_message, write_message, Message},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_message(&mut writer, args.name.as_str())
        .await
        .context("failed to send display name")?;
    write_stdout(&format!("*** connected as {}", args.name)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let leaving = run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    if leaving {
        say_goodbye(&mut writer).await;
    }
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

/// Returns `true` when the user is leaving and the relay should be told so.
async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<bool> {
    loop {
        input.clear();
        select! {
            line = read_message::<_, String>(reader) => {
                if !handle_server_line(line).await? {
                    return Ok(false);
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    return Ok(true);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(true);
            }
        }
    }
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line? {
        Some(line) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.eq_ignore_ascii_case("/quit") {
        return Ok(false);
    }

    write_message(writer, &Message::text(text)).await?;
    Ok(true)
}

async fn say_goodbye(writer: &mut OwnedWriteHalf) {
    if let Err(error) = write_message(writer, &Message::disconnect()).await {
        warn!(?error, "failed to send disconnect");
    }
    if let Err(error) = write_stdout("*** leaving chat").await {
        warn!(?error, "failed to write to stdout");
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
