use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args.address).await?;
    send_handshake(&mut writer, &args.peer_id).await?;

    let mut stdout = tokio::io::stdout();
    write_line(
        &mut stdout,
        &format!("Welcome to your peering relationship! Your ID: {}", args.peer_id),
    )
    .await?;

    let stdin = BufReader::new(tokio::io::stdin());
    relay(reader.lines(), &mut writer, stdin.lines(), &mut stdout).await
}

async fn establish_connection(address: &str) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;

    info!("connected to {address}");

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn send_handshake<W>(writer: &mut W, peer_id: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{peer_id}\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Prints server lines to `output` and forwards local input until the server
/// hangs up.
///
/// Both sides are polled through `Lines::next_line`, which keeps a partially
/// received line buffered when the other branch wins the `select!`.
///
/// Once local input is exhausted the write side is shut down, which the
/// server treats as a disconnect; the loop then keeps printing whatever is
/// still in flight until the socket closes.
async fn relay<S, W, I, O>(
    mut server: Lines<S>,
    writer: &mut W,
    mut input: Lines<I>,
    output: &mut O,
) -> Result<()>
where
    S: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut input_open = true;

    loop {
        select! {
            server_line = server.next_line() => {
                match server_line? {
                    Some(line) => write_line(output, &line).await?,
                    None => {
                        write_line(output, "*** server closed the connection").await?;
                        break;
                    }
                }
            }
            input_line = input.next_line(), if input_open => {
                input_open = forward_input(input_line?, writer).await?;
            }
        }
    }
    Ok(())
}

/// Sends one stdin line to the server. `None` means stdin is exhausted.
async fn forward_input<W>(line: Option<String>, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = line else {
        if let Err(error) = writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
        return Ok(false);
    };

    writer.write_all(format!("{line}\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(true)
}

async fn write_line<O>(output: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(format!("{line}\n").as_bytes()).await?;
    output.flush().await
}
