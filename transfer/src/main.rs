//! File transfer over the TOU transport.
//!
//! `send` streams a file to a receiving peer; `recv` accepts one transfer
//! and stores the file. The stream starts with a small header (name
//! length, name, byte size) followed by the raw contents.
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use failure::{bail, Error};
use std::fs::File;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use structopt::StructOpt;
use tou::TouSocket;
use tracing::info;

/// Payload bytes per data segment.
const CHUNK: usize = 16 * 1024;

#[derive(StructOpt)]
#[structopt(
    name = "tou-transfer",
    about = "Transfers a file between two peers over TOU."
)]
enum Command {
    /// Sends a file to a receiving peer.
    #[structopt(name = "send")]
    Send {
        /// The file to send.
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        /// Endpoint of the receiving peer, e.g. 127.0.0.1:7000.
        remote: SocketAddr,
        /// Local endpoint to bind; port 0 picks an ephemeral one.
        #[structopt(long = "bind", default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
    /// Receives one file and stores it in a directory.
    #[structopt(name = "recv")]
    Recv {
        /// Local endpoint to listen on.
        local: SocketAddr,
        /// Directory to store the received file in.
        #[structopt(long = "into", parse(from_os_str), default_value = ".")]
        into: PathBuf,
    },
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    match Command::from_args() {
        Command::Send { file, remote, bind } => {
            async_std::task::block_on(send(file, remote, bind))
        }
        Command::Recv { local, into } => async_std::task::block_on(recv(local, into)),
    }
}

async fn send(path: PathBuf, remote: SocketAddr, bind: SocketAddr) -> Result<(), Error> {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => bail!("{} has no file name", path.display()),
    };
    let mut file = File::open(&path)?;
    let size = file.metadata()?.len();

    let socket = TouSocket::bind(bind).await?;
    let stream = socket.connect(remote).await?;
    info!("connected to {}", remote);

    let mut header = BytesMut::with_capacity(2 + name.len() + 8);
    header.put_u16_be(name.len() as u16);
    header.put_slice(name.as_bytes());
    header.put_u64_be(size);
    stream.write(&header).await?;

    let mut buf = vec![0u8; CHUNK];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stream.write(&buf[..n]).await?;
        sent += n as u64;
    }
    info!("sent {} ({} bytes)", name, sent);

    stream.close().await?;
    socket.close().await?;
    Ok(())
}

async fn recv(local: SocketAddr, into: PathBuf) -> Result<(), Error> {
    let socket = TouSocket::bind(local).await?;
    socket.listen()?;
    info!("listening on {}", socket.local_addr());
    let stream = socket.accept().await?;
    info!("transfer from {}", stream.peer_addr());

    let header = match stream.read().await? {
        Some(header) => header,
        None => bail!("peer closed before sending a header"),
    };
    if header.len() < 2 {
        bail!("malformed transfer header");
    }
    let name_len = BigEndian::read_u16(&header[..2]) as usize;
    if header.len() < 2 + name_len + 8 {
        bail!("malformed transfer header");
    }
    let name = String::from_utf8_lossy(&header[2..2 + name_len]).into_owned();
    let size = BigEndian::read_u64(&header[2 + name_len..2 + name_len + 8]);
    // never trust a peer-supplied path
    let name = match PathBuf::from(&name).file_name() {
        Some(name) => name.to_owned(),
        None => bail!("peer sent an empty file name"),
    };

    let path = into.join(&name);
    let mut file = File::create(&path)?;
    let mut received = 0u64;
    while received < size {
        match stream.read().await? {
            Some(payload) => {
                file.write_all(&payload)?;
                received += payload.len() as u64;
            }
            None => bail!("peer closed after {} of {} bytes", received, size),
        }
    }
    info!("stored {} ({} bytes)", path.display(), received);

    stream.close().await?;
    socket.close().await?;
    Ok(())
}
