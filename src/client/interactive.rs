//! Interactive Chat Client
//!
//! Lines typed on stdin are sent as messages; messages from other clients are
//! printed as `<name> text`. `/quit` or end of input leaves the chat.

use std::net::SocketAddr;

use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::mpsc;
use tracing::warn;

use super::connection::{ClientReader, ClientWriter, RelayClient};
use crate::protocol::ChatMessage;
use crate::Result;

const QUIT_COMMAND: &str = "/quit";

/// Join the relay at `addr` as `name` and chat over stdin/stdout
pub async fn run(addr: SocketAddr, name: &str) -> Result<()> {
    let client = RelayClient::connect(addr, name).await?;
    let stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    select! {
        result = run_session(client, stdin, &mut stdout) => result,
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            Ok(())
        }
    }
}

/// Drive one chat session over arbitrary input and output streams
pub async fn run_session<I, O>(client: RelayClient, input: I, output: &mut O) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (reader, mut writer) = client.into_split();
    write_line(output, &format!("*** connected as {}", writer.name())).await?;

    // Frame reads are not cancel-safe, so they run in their own task.
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(forward_incoming(reader, incoming_tx));

    let mut lines = input.lines();
    let result = loop {
        select! {
            incoming = incoming_rx.recv() => {
                match handle_incoming(incoming, output).await {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => break Err(e.into()),
                };
                match handle_input(line, &mut writer, output).await {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    writer.shutdown().await;
    reader_task.abort();
    result
}

async fn forward_incoming(
    mut reader: ClientReader,
    incoming_tx: mpsc::UnboundedSender<Result<Option<ChatMessage>>>,
) {
    loop {
        let incoming = reader.recv().await;
        let finished = !matches!(incoming, Ok(Some(_)));
        if incoming_tx.send(incoming).is_err() || finished {
            break;
        }
    }
}

async fn handle_incoming<O>(
    incoming: Option<Result<Option<ChatMessage>>>,
    output: &mut O,
) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    match incoming.transpose()?.flatten() {
        Some(message) => {
            write_line(output, &format!("<{}> {}", message.name, message.text)).await?;
            Ok(true)
        }
        None => {
            write_line(output, "*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_input<O>(line: Option<String>, writer: &mut ClientWriter, output: &mut O) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case(QUIT_COMMAND) {
        write_line(output, "*** leaving chat").await?;
        return Ok(false);
    }

    writer.send(text).await?;
    Ok(true)
}

async fn write_line<O>(output: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
