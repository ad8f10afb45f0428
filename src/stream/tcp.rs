//! Receiving an import stream over TCP

use crate::error::{Error, Result};
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::ops::RangeInclusive;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Ports tried for incoming import streams
pub const IMPORT_PORTS: RangeInclusive<u16> = 60000..=60050;

/// Time to wait for the sender to connect
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Listening socket for a single incoming import stream
#[derive(Debug)]
pub struct ImportListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ImportListener {
    /// Bind the first free port of [`IMPORT_PORTS`] on `ip`
    pub fn bind(ip: IpAddr) -> Result<Self> {
        Self::bind_in(ip, IMPORT_PORTS)
    }

    pub fn bind_in(ip: IpAddr, ports: RangeInclusive<u16>) -> Result<Self> {
        for port in ports.clone() {
            match TcpListener::bind((ip, port)) {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    debug!(%addr, "listening for import stream");
                    return Ok(Self { listener, addr });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Other(format!(
            "unable to find free port in range {}-{}",
            ports.start(),
            ports.end()
        )))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tell the sender where to connect: `<ip>\n<port>\n`
    pub fn announce<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        write!(out, "{}\n{}\n", self.addr.ip(), self.addr.port())?;
        out.flush()?;
        Ok(())
    }

    /// Wait for one connection
    pub fn accept(self, timeout: Duration) -> Result<TcpStream> {
        self.listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "accepted import connection");
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(format!(
                            "import connection on {}",
                            self.addr
                        )));
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_announce_and_accept() {
        let listener = ImportListener::bind_in(LOCALHOST, 0..=0).unwrap();
        let addr = listener.local_addr();

        let mut announced = Vec::new();
        listener.announce(&mut announced).unwrap();
        assert_eq!(
            String::from_utf8(announced).unwrap(),
            format!("127.0.0.1\n{}\n", addr.port())
        );

        let sender = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"payload").unwrap();
        });

        let mut stream = listener.accept(Duration::from_secs(5)).unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        sender.join().unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_accept_timeout() {
        let listener = ImportListener::bind_in(LOCALHOST, 0..=0).unwrap();
        let err = listener.accept(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
