//! Minimal client connection for talking to a ticketd node
//!
//! One request in flight at a time over a framed TCP connection. Used by
//! the integration tests; a CLI would build on the same type.

use crate::api::{ClientRequest, ClientResponse};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(String),

    #[error("server closed the connection")]
    Closed,
}

pub struct ClientConn {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl ClientConn {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    pub async fn call(&mut self, request: &ClientRequest) -> Result<ClientResponse, ClientError> {
        let bytes =
            bincode::serialize(request).map_err(|e| ClientError::Codec(e.to_string()))?;
        self.framed.send(Bytes::from(bytes)).await?;

        let frame = self.framed.next().await.ok_or(ClientError::Closed)??;
        bincode::deserialize(&frame).map_err(|e| ClientError::Codec(e.to_string()))
    }
}
