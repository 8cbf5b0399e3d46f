use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::Dispatcher;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    state: ConnectionState,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            dispatcher,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match &mut self.state {
                ConnectionState::Reading => {
                    // An idle keep-alive connection is dropped on shutdown;
                    // a request already being read or dispatched is finished.
                    let shutdown = self.shutdown.clone();
                    let idle = self.buffer.is_empty();
                    let next = tokio::select! {
                        res = self.read_request() => res,
                        _ = shutdown.cancelled(), if idle => Ok(None),
                    };

                    self.state = match next {
                        Ok(Some(req)) => ConnectionState::Processing(req),
                        Ok(None) => ConnectionState::Closed,
                        Err(ReadError::Malformed(e)) => {
                            tracing::debug!(peer = %self.peer, error = ?e, "Malformed request");
                            ConnectionState::Writing(ResponseWriter::new(&Response::bad_request()), false)
                        }
                        Err(ReadError::Io(e)) => return Err(e.into()),
                    };
                }

                ConnectionState::Processing(req) => {
                    let response = self.dispatcher.dispatch(req, Some(self.peer)).await;
                    let keep_alive = req.keep_alive() && !self.shutdown.is_cancelled();

                    let writer = ResponseWriter::new(&response);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if *keep_alive {
                        self.state = ConnectionState::Reading;
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self) -> Result<Option<Request>, ReadError> {
        loop {
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(Some(request));
                }
                Err(ParseError::Incomplete) => {}
                Err(e) => return Err(ReadError::Malformed(e)),
            }

            let mut temp = [0u8; 4096];
            let n = self.stream.read(&mut temp).await.map_err(ReadError::Io)?;

            if n == 0 {
                // Client closed connection
                return Ok(None);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

enum ReadError {
    Malformed(ParseError),
    Io(std::io::Error),
}
