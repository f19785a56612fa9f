// src/worker/data_server.rs

//! Peer-to-peer object transfer.
//!
//! Every worker serves its local objects to other workers and to clients.
//! A connection carries any number of request/reply pairs.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::protocol::codec;
use crate::protocol::{DataReply, DataRequest};
use crate::types::ObjectId;
use crate::worker::store::LocalStore;

pub async fn serve(listener: TcpListener, store: Arc<LocalStore>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &store).await {
                debug!(%peer, error = %err, "data connection ended with an error");
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, store: &LocalStore) -> Result<()> {
    let mut framed = codec::framed(stream);
    while let Some(request) = codec::recv::<_, DataRequest>(&mut framed).await? {
        let DataRequest::Fetch { object } = request;
        let reply = match store.get(object).await {
            Ok(Some(bytes)) => DataReply::Data(bytes.to_vec()),
            Ok(None) => DataReply::NotFound,
            Err(err) => {
                warn!(object = %object, error = %err, "could not read object for peer");
                DataReply::NotFound
            }
        };
        codec::send(&mut framed, &reply).await?;
    }
    Ok(())
}

/// Fetch `object` from the data server at `address`. `None` if the peer
/// does not have it.
pub async fn pull(address: &str, object: ObjectId) -> Result<Option<Vec<u8>>> {
    let stream = TcpStream::connect(address).await?;
    let mut framed = codec::framed(stream);
    codec::send(&mut framed, &DataRequest::Fetch { object }).await?;
    match codec::expect::<_, DataReply>(&mut framed).await? {
        DataReply::Data(data) => Ok(Some(data)),
        DataReply::NotFound => Ok(None),
    }
}
