//! # UDP Channel
//!
//! [`DatagramChannel`] over a tokio UDP socket. Outgoing datagrams queue on one
//! lane per [`Priority`]; a single sender task always drains the highest
//! non-empty lane first and pauses `send_delay` between datagrams.
//! `Immediate` skips the queue and the pause.
//!
//! ```text
//! send_to(Immediate) ───────────────────────────► socket
//! send_to(High)   ──► [lane] ─┐
//! send_to(Medium) ──► [lane] ─┼─► sender task ──► socket
//! send_to(Low)    ──► [lane] ─┘   (send_delay)
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocols::{DatagramChannel, Priority};
use crate::wire::MAX_PACKET_SIZE;

/// Queued datagrams per lane before `send_to` applies backpressure.
const LANE_CAPACITY: usize = 1024;

/// Receive buffer; larger than any DHT datagram so foreign traffic is not
/// truncated before it is classified.
const RECV_BUFFER_SIZE: usize = 65536;

type Outgoing = (Vec<u8>, SocketAddr);

struct Lanes {
    high: mpsc::Sender<Outgoing>,
    medium: mpsc::Sender<Outgoing>,
    low: mpsc::Sender<Outgoing>,
}

pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    lanes: Lanes,
}

impl UdpChannel {
    /// Bind and start the sender task. Must be called inside a tokio runtime.
    pub async fn bind(addr: SocketAddr, send_delay: Duration) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let (high_tx, high_rx) = mpsc::channel(LANE_CAPACITY);
        let (medium_tx, medium_rx) = mpsc::channel(LANE_CAPACITY);
        let (low_tx, low_rx) = mpsc::channel(LANE_CAPACITY);
        tokio::spawn(run_sender(socket.clone(), send_delay, high_rx, medium_rx, low_rx));

        debug!(addr = %local_addr, "udp channel bound");
        Ok(Self {
            socket,
            local_addr,
            lanes: Lanes { high: high_tx, medium: medium_tx, low: low_tx },
        })
    }
}

async fn run_sender(
    socket: Arc<UdpSocket>,
    send_delay: Duration,
    mut high: mpsc::Receiver<Outgoing>,
    mut medium: mpsc::Receiver<Outgoing>,
    mut low: mpsc::Receiver<Outgoing>,
) {
    loop {
        let next = tokio::select! {
            biased;
            Some(item) = high.recv() => item,
            Some(item) = medium.recv() => item,
            Some(item) = low.recv() => item,
            else => break,
        };
        let (datagram, to) = next;
        if let Err(e) = socket.send_to(&datagram, to).await {
            debug!(to = %to, error = %e, "datagram send failed");
        }
        if !send_delay.is_zero() {
            tokio::time::sleep(send_delay).await;
        }
    }
    trace!("udp sender stopped");
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send_to(&self, datagram: Vec<u8>, to: SocketAddr, priority: Priority) -> io::Result<()> {
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "datagram exceeds packet size"));
        }
        let lane = match priority {
            Priority::Immediate => {
                self.socket.send_to(&datagram, to).await?;
                return Ok(());
            }
            Priority::High => &self.lanes.high,
            Priority::Medium => &self.lanes.medium,
            Priority::Low => &self.lanes.low,
        };
        lane.send((datagram, to))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "udp sender stopped"))
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_send_and_receive() {
        let a = UdpChannel::bind("127.0.0.1:0".parse().unwrap(), Duration::ZERO).await.unwrap();
        let b = UdpChannel::bind("127.0.0.1:0".parse().unwrap(), Duration::ZERO).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"low".to_vec(), b_addr, Priority::Low).await.unwrap();
        let (data, from) = b.recv_from().await.unwrap();
        assert_eq!(data, b"low");
        assert_eq!(from, a.local_addr().unwrap());

        a.send_to(b"now".to_vec(), b_addr, Priority::Immediate).await.unwrap();
        let (data, _) = b.recv_from().await.unwrap();
        assert_eq!(data, b"now");
    }

    #[tokio::test]
    async fn oversized_datagram_refused() {
        let a = UdpChannel::bind("127.0.0.1:0".parse().unwrap(), Duration::ZERO).await.unwrap();
        let err = a
            .send_to(vec![0; MAX_PACKET_SIZE + 1], "127.0.0.1:9".parse().unwrap(), Priority::High)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
