//! Chat client: connector, handshake and receive loop
//!
//! The handshake sends the display name on a fixed interval until the server
//! echoes it back. A spawned reader task waits for the echo while a timer
//! bounds the whole exchange; the reader is always joined before `connect`
//! returns. After that, a background task decodes the server's fixed-layout
//! records into a channel.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::AppError;
use crate::message::{encode_line, truncate_utf8, WireMessage, NAME_CAPACITY};

/// Buffered inbound messages before the receive loop waits
const INCOMING_BUFFER_SIZE: usize = 64;

/// Client ready to connect
#[derive(Debug, Clone)]
pub struct ChatClient {
    config: ClientConfig,
    name: String,
}

impl ChatClient {
    /// Validate the display name
    ///
    /// Empty names and names containing NUL are rejected; names longer than
    /// 31 bytes are truncated on a character boundary.
    pub fn new(config: ClientConfig) -> Result<Self, AppError> {
        if config.name.is_empty() || config.name.contains('\0') {
            return Err(AppError::InvalidName(config.name));
        }

        let name = truncate_utf8(&config.name, NAME_CAPACITY).to_string();
        if name.len() < config.name.len() {
            warn!("Display name truncated to '{}'", name);
        }

        Ok(Self { config, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect, perform the handshake and start the receive loop
    pub async fn connect(self) -> Result<ChatSession, AppError> {
        let stream = TcpStream::connect(self.config.server_addr)
            .await
            .map_err(|e| AppError::setup("Can't connect to the server", e))?;
        info!("Connection established with {}", self.config.server_addr);

        let (reader, mut writer) = stream.into_split();
        let reader = handshake(reader, &mut writer, self.name.as_bytes(), &self.config).await?;
        info!("Joined the chat as '{}'", self.name);

        let (incoming_tx, incoming) = mpsc::channel(INCOMING_BUFFER_SIZE);
        let receiver = tokio::spawn(receive_loop(reader, incoming_tx));

        Ok(ChatSession {
            name: self.name,
            writer,
            incoming,
            receiver,
        })
    }
}

/// Send the name until it is echoed, the timer fires, or the transport fails
async fn handshake(
    reader: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    name: &[u8],
    config: &ClientConfig,
) -> Result<OwnedReadHalf, AppError> {
    let expected_len = name.len();
    let mut ack_reader = tokio::spawn(async move {
        let mut reader = reader;
        let mut ack = vec![0u8; expected_len];
        reader.read_exact(&mut ack).await.map(|_| (reader, ack))
    });

    let deadline = time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    let mut retry = time::interval(config.retry_interval);

    loop {
        tokio::select! {
            joined = &mut ack_reader => {
                let (reader, ack) = joined??;
                if ack != name {
                    return Err(AppError::HandshakeRejected);
                }
                return Ok(reader);
            }
            _ = &mut deadline => {
                ack_reader.abort();
                let _ = ack_reader.await;
                return Err(AppError::HandshakeTimeout(config.handshake_timeout));
            }
            _ = retry.tick() => {
                debug!("Sending the name to the server");
                if let Err(e) = writer.write_all(name).await {
                    ack_reader.abort();
                    let _ = ack_reader.await;
                    return Err(e.into());
                }
            }
        }
    }
}

/// Decode server records until EOF, an error, or the session is dropped
async fn receive_loop(mut reader: OwnedReadHalf, incoming: mpsc::Sender<WireMessage>) {
    loop {
        match WireMessage::read_from(&mut reader).await {
            Ok(msg) => {
                if incoming.send(msg).await.is_err() {
                    debug!("Session dropped, stopping the receive loop");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("The server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Error while receiving a message from the server: {}", e);
                break;
            }
        }
    }
}

/// An established chat connection
#[derive(Debug)]
pub struct ChatSession {
    name: String,
    writer: OwnedWriteHalf,
    incoming: mpsc::Receiver<WireMessage>,
    receiver: JoinHandle<()>,
}

impl ChatSession {
    /// Display name acknowledged by the server
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one chat line
    pub async fn send_text(&mut self, text: &str) -> Result<(), AppError> {
        self.writer.write_all(&encode_line(text)).await?;
        Ok(())
    }

    /// Next message relayed from another client
    ///
    /// Returns `None` once the server has closed the connection.
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        self.incoming.recv().await
    }

    /// Half-close the connection and wait for the receive loop to finish
    pub async fn close(self) -> Result<(), AppError> {
        let ChatSession {
            mut writer,
            incoming,
            receiver,
            ..
        } = self;

        drop(incoming);
        writer.shutdown().await?;
        if let Err(e) = receiver.await {
            warn!("Receive loop failed: {}", e);
        }
        Ok(())
    }

    /// Interactive loop
    ///
    /// Every inbound message is written to `output` as `name : text`; every
    /// line of `input` is sent to the server. Stops when `input` ends or a
    /// send fails, then half-closes and waits for the server to hang up.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<(), AppError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ChatSession {
            mut writer,
            incoming,
            receiver,
            ..
        } = self;

        let printer = tokio::spawn(print_incoming(incoming, output));

        let mut lines = input.lines();
        let result = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = writer.write_all(&encode_line(&line)).await {
                        error!("Impossible to send the message to the server: {}", e);
                        break Err(e.into());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        if let Err(e) = writer.shutdown().await {
            debug!("Error while closing the connection: {}", e);
        }
        if let Err(e) = receiver.await {
            warn!("Receive loop failed: {}", e);
        }
        if let Err(e) = printer.await {
            warn!("Output task failed: {}", e);
        }

        info!("End of the connection with the server");
        result
    }
}

/// Write each inbound message as `name : text`
///
/// Stops at the first write or flush failure; dropping `incoming` then ends
/// the receive loop. Returns the number of messages printed.
async fn print_incoming<W>(mut incoming: mpsc::Receiver<WireMessage>, mut output: W) -> usize
where
    W: AsyncWrite + Unpin,
{
    let mut printed = 0;
    while let Some(msg) = incoming.recv().await {
        let line = format!("{}\n", msg);
        if let Err(e) = output.write_all(line.as_bytes()).await {
            debug!("Output closed: {}", e);
            break;
        }
        if let Err(e) = output.flush().await {
            debug!("Output closed: {}", e);
            break;
        }
        printed += 1;
    }
    printed
}
