// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Moving framed messages over the daemon's Unix socket.
//!
//! Every message is preceded by a [`FrameHeader`] holding its length. Before any message
//! is sent, the client transmits a single byte carrying its process credentials as
//! `SCM_CREDENTIALS` ancillary data so the daemon can decide whether to serve it.

use std::{
    io::{self, IoSlice, IoSliceMut, Read},
    mem::MaybeUninit,
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::UnixStream,
    },
    path::Path,
};

use bytes::{BufMut, BytesMut};
use rustix::{
    io::Errno,
    net::{
        RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
        SendAncillaryMessage, SendFlags, UCred,
    },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tracing::{Level, instrument};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, network_endian::U32};

use crate::{
    error::{Error, ProtocolError, TransportError},
    message::Message,
};

/// The byte the client sends along with its credentials.
const CREDENTIALS_BYTE: u8 = 0;

/// The length prefix of every message.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    length: U32,
}

impl FrameHeader {
    pub fn new(length: u32) -> Self {
        Self {
            length: U32::new(length),
        }
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        FrameHeader::read_from_bytes(bytes)
            .map_err(|_| ProtocolError::Malformed("invalid frame header".to_string()))
    }
}

/// The identity of a connected peer, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl From<UCred> for PeerCredentials {
    fn from(value: UCred) -> Self {
        Self {
            pid: value.pid.as_raw_nonzero().get(),
            uid: value.uid.as_raw(),
            gid: value.gid.as_raw(),
        }
    }
}

/// A blocking client connection to the daemon.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    /// Connect to the daemon and send this process's credentials.
    #[instrument(level = Level::DEBUG, fields(path = %path.display()), err)]
    pub fn connect(path: &Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        send_credentials(stream.as_fd()).map_err(TransportError::Credentials)?;
        tracing::debug!("Connected to the daemon");
        Ok(Self { stream })
    }

    /// Send one framed message.
    pub fn send(&mut self, message: &Message) -> Result<(), Error> {
        let body = message.as_bytes();
        let length =
            u32::try_from(body.len()).map_err(|_| Error::ArgumentsBad("request is too large"))?;
        let header = FrameHeader::new(length);
        send_all(self.stream.as_fd(), header.as_bytes()).map_err(TransportError::Send)?;
        send_all(self.stream.as_fd(), body).map_err(TransportError::Send)?;
        Ok(())
    }

    /// Receive one framed message into `message`.
    ///
    /// Responses announcing more than `limit` bytes are refused before anything is
    /// allocated for them.
    pub fn receive(&mut self, message: &mut Message, limit: u32) -> Result<(), Error> {
        let mut header = [0_u8; std::mem::size_of::<FrameHeader>()];
        receive_exact(&mut self.stream, &mut header)?;
        let length = FrameHeader::parse(&header)?.length();
        if length > limit {
            return Err(TransportError::FrameTooLarge {
                size: length,
                limit,
            }
            .into());
        }
        // The header is already consumed, so failing to hold the body is a transport failure.
        let out_of_memory = || TransportError::Receive(io::ErrorKind::OutOfMemory.into());
        let length = usize::try_from(length).map_err(|_| out_of_memory())?;
        let body = message.receive_buffer(length).ok_or_else(out_of_memory)?;
        receive_exact(&mut self.stream, body)?;
        Ok(())
    }
}

/// Write all of `bytes`, retrying on interruption.
///
/// `MSG_NOSIGNAL` keeps a closed daemon socket from raising `SIGPIPE` in the host
/// application; the broken pipe is reported as an error instead.
fn send_all(fd: BorrowedFd<'_>, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match rustix::net::send(fd, bytes, SendFlags::NOSIGNAL) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(sent) => bytes = &bytes[sent..],
            Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

fn receive_exact(stream: &mut UnixStream, buffer: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buffer.len() {
        match stream.read(&mut buffer[filled..]) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(read) => filled += read,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(error) => return Err(TransportError::Receive(error)),
        }
    }
    Ok(())
}

fn send_credentials(fd: BorrowedFd<'_>) -> io::Result<()> {
    let credentials = UCred {
        pid: rustix::process::getpid(),
        uid: rustix::process::getuid(),
        gid: rustix::process::getgid(),
    };
    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmCredentials(1))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !control.push(SendAncillaryMessage::ScmCredentials(credentials)) {
        return Err(io::Error::other("credentials do not fit in the control buffer"));
    }
    let payload = [CREDENTIALS_BYTE];
    loop {
        match rustix::net::sendmsg(
            fd,
            &[IoSlice::new(&payload)],
            &mut control,
            SendFlags::NOSIGNAL,
        ) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err(io::ErrorKind::WriteZero.into()),
            Err(Errno::INTR) => continue,
            Err(error) => return Err(error.into()),
        }
    }
}

/// Ask the kernel to attach credentials to messages received on `fd`.
pub fn enable_credentials(fd: BorrowedFd<'_>) -> io::Result<()> {
    rustix::net::sockopt::set_socket_passcred(fd, true)?;
    Ok(())
}

/// Receive the client's credential byte and the credentials sent with it.
///
/// If the client didn't attach `SCM_CREDENTIALS`, the credentials the kernel recorded at
/// connect time are used instead.
#[instrument(level = Level::DEBUG, skip_all, err)]
pub async fn receive_credentials(stream: &tokio::net::UnixStream) -> io::Result<PeerCredentials> {
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || receive_credentials_now(stream.as_fd())) {
            Ok(Some(credentials)) => return Ok(credentials.into()),
            Ok(None) => {
                tracing::debug!("Client sent no credentials; falling back to SO_PEERCRED");
                let credentials = rustix::net::sockopt::socket_peercred(stream.as_fd())?;
                return Ok(credentials.into());
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(error),
        }
    }
}

fn receive_credentials_now(fd: BorrowedFd<'_>) -> io::Result<Option<UCred>> {
    let mut byte = [0_u8; 1];
    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmCredentials(1))];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let received = rustix::net::recvmsg(
        fd,
        &mut [IoSliceMut::new(&mut byte)],
        &mut control,
        RecvFlags::DONTWAIT,
    )?;
    if received.bytes == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    if byte[0] != CREDENTIALS_BYTE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected credentials byte",
        ));
    }
    let credentials = control.drain().find_map(|message| match message {
        RecvAncillaryMessage::ScmCredentials(credentials) => Some(credentials),
        _ => None,
    });
    Ok(credentials)
}

/// Read one framed message from an async stream.
///
/// Returns `None` if the peer closed the connection cleanly between messages.
pub async fn read_frame<R>(reader: &mut R, limit: u32) -> anyhow::Result<Option<BytesMut>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0_u8; std::mem::size_of::<FrameHeader>()];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    let length = FrameHeader::parse(&header)?.length();
    if length > limit {
        return Err(anyhow::anyhow!(
            "request of {length} bytes exceeds the {limit} byte limit"
        ));
    }
    let length = usize::try_from(length)?;
    let mut body = BytesMut::with_capacity(length).limit(length);
    while body.remaining_mut() != 0 {
        if reader.read_buf(&mut body).await? == 0 {
            return Err(anyhow::anyhow!("connection closed mid-message"));
        }
    }
    Ok(Some(body.into_inner()))
}

/// Write one framed message to an async stream.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let header = FrameHeader::new(u32::try_from(body.len())?);
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::calls::CallId;
    use crate::message::{Direction, Header, Value};

    #[test]
    fn frame_header_is_big_endian() {
        let header = FrameHeader::new(0x0102_0304);
        assert_eq!(header.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(FrameHeader::parse(&[0, 0, 1, 0]).unwrap().length(), 256);
        assert!(FrameHeader::parse(&[0, 1]).is_err());
    }

    fn pair() -> (Connection, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        (Connection { stream: client }, server)
    }

    #[test]
    fn send_frames_message() -> Result<(), Error> {
        let (mut connection, mut server) = pair();
        let mut message = Message::new();
        message.prepare(CallId::Logout, Direction::Request)?;
        message.write_all(&[Value::Ulong(3)])?;
        connection.send(&message)?;

        let mut received = [0_u8; 12];
        server.read_exact(&mut received).unwrap();
        assert_eq!(received, [0, 0, 0, 8, 0, 0, 0, 22, 0, 0, 0, 3]);
        Ok(())
    }

    #[test]
    fn receive_reads_whole_frame() -> Result<(), Error> {
        let (mut connection, mut server) = pair();
        server.write_all(&[0, 0, 0, 8, 0, 0, 0, 22]).unwrap();
        // Deliver the rest of the body separately to exercise short reads.
        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            server.write_all(&[0, 0, 0, 0]).unwrap();
            server
        });
        let mut message = Message::new();
        connection.receive(&mut message, 1024)?;
        assert_eq!(message.parse(Direction::Response)?, Header::Call(CallId::Logout));
        drop(writer.join());
        Ok(())
    }

    #[test]
    fn disconnect_mid_frame() {
        let (mut connection, mut server) = pair();
        server.write_all(&[0, 0, 0, 8, 0, 0]).unwrap();
        drop(server);
        let mut message = Message::new();
        assert!(matches!(
            connection.receive(&mut message, 1024),
            Err(Error::Transport(TransportError::Disconnected))
        ));
    }

    #[test]
    fn oversized_frame() {
        let (mut connection, mut server) = pair();
        server.write_all(&[0, 0, 4, 1]).unwrap();
        let mut message = Message::new();
        assert!(matches!(
            connection.receive(&mut message, 1024),
            Err(Error::Transport(TransportError::FrameTooLarge { size: 1025, limit: 1024 }))
        ));
    }

    #[test]
    fn send_to_closed_socket_is_an_error() -> Result<(), Error> {
        let (mut connection, server) = pair();
        drop(server);
        let mut message = Message::new();
        message.prepare(CallId::Finalize, Direction::Request)?;
        assert!(matches!(
            connection.send(&message),
            Err(Error::Transport(TransportError::Send(_)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn credentials_are_received() -> anyhow::Result<()> {
        let (client, server) = UnixStream::pair()?;
        server.set_nonblocking(true)?;
        let server = tokio::net::UnixStream::from_std(server)?;
        enable_credentials(server.as_fd())?;
        send_credentials(client.as_fd())?;

        let credentials = receive_credentials(&server).await?;
        assert_eq!(credentials.uid, rustix::process::getuid().as_raw());
        assert_eq!(
            credentials.pid,
            rustix::process::getpid().as_raw_nonzero().get()
        );
        Ok(())
    }

    #[tokio::test]
    async fn async_frames() -> anyhow::Result<()> {
        let (mut client, mut server) = tokio::net::UnixStream::pair()?;
        write_frame(&mut client, b"hello").await?;
        let frame = read_frame(&mut server, 16).await?.expect("a frame");
        assert_eq!(&frame[..], b"hello");

        write_frame(&mut client, &[0; 17]).await?;
        assert!(read_frame(&mut server, 16).await.is_err());

        drop(client);
        let (mut client, mut server) = tokio::net::UnixStream::pair()?;
        client.shutdown().await?;
        assert!(read_frame(&mut server, 16).await?.is_none());
        Ok(())
    }
}
