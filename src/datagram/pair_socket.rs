// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::lock::Mutex;
use futures::prelude::*;
use futures::task::{Context, Poll};
use std::fmt::{Debug, Display, Formatter};
use std::pin::Pin;

/// Simplified "SocketAddr" for [`PairSocket`]: one name for each end of the
/// pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PairSocketAddr {
    /// The end returned first from [`PairSocket::pair`].
    North,

    /// The end returned second from [`PairSocket::pair`].
    South,
}

impl PairSocketAddr {
    /// Returns the address of the opposite end.
    pub fn opposite(self) -> PairSocketAddr {
        match self {
            PairSocketAddr::North => PairSocketAddr::South,
            PairSocketAddr::South => PairSocketAddr::North,
        }
    }
}

impl Display for PairSocketAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl SocketAddrExt for PairSocketAddr {
    fn port(&self) -> u16 {
        0
    }

    fn conforming_to(&self, _local: Self) -> Option<Self> {
        Some(*self)
    }

    fn addr_to_string(&self) -> String {
        match self {
            PairSocketAddr::North => "north",
            PairSocketAddr::South => "south",
        }
        .to_string()
    }
}

impl ToSocketAddrs for PairSocketAddr {
    type Iter = std::option::IntoIter<Self::SocketAddr>;
    type SocketAddr = Self;
    type Error = super::Error;

    fn to_socket_addrs(&self) -> Result<Self::Iter, Self::Error> {
        Ok(Some(*self).into_iter())
    }
}

/// An instance of [`AsyncDatagramSocket`] representing one end of an
/// in-memory socket pair: every packet sent on one end is received on the
/// other.
///
/// This is what the scenario tests run the reliability machinery over, with
/// one endpoint on each end standing in for a client/server pair without
/// touching the network.
#[derive(Debug)]
pub struct PairSocket {
    local: PairSocketAddr,
    // Message is (packet_bytes, source_addr)
    sender: Sender<(Vec<u8>, PairSocketAddr)>,
    receiver: Mutex<Receiver<(Vec<u8>, PairSocketAddr)>>,
}

impl PairSocket {
    /// Creates a connected pair of [`PairSocket`] instances.
    pub fn pair() -> (PairSocket, PairSocket) {
        let (north_tx, south_rx) = channel(64);
        let (south_tx, north_rx) = channel(64);

        (
            PairSocket {
                local: PairSocketAddr::North,
                sender: north_tx,
                receiver: Mutex::new(north_rx),
            },
            PairSocket {
                local: PairSocketAddr::South,
                sender: south_tx,
                receiver: Mutex::new(south_rx),
            },
        )
    }
}

impl Unpin for PairSocket {}

impl AsyncDatagramSocket for PairSocket {}

impl DatagramSocketTypes for PairSocket {
    type SocketAddr = PairSocketAddr;
    type Error = super::Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        Ok(self.local)
    }

    fn lookup_host(
        _host: &str,
        _port: u16,
    ) -> Result<std::vec::IntoIter<Self::SocketAddr>, Self::Error>
    where
        Self: Sized,
    {
        Ok(vec![PairSocketAddr::North, PairSocketAddr::South].into_iter())
    }
}

impl AsyncSendTo for PairSocket {
    fn poll_send_to<B>(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        addr: B,
    ) -> Poll<Result<usize, Self::Error>>
    where
        B: super::ToSocketAddrs<SocketAddr = Self::SocketAddr, Error = Self::Error>,
    {
        if addr.to_socket_addrs()?.next().is_none() {
            return Poll::Ready(Err(Error::HostNotFound));
        }

        let mut sender = self.get_ref().sender.clone();
        match sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => match sender.start_send((buf.to_vec(), self.get_ref().local)) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => {
                    if e.is_full() {
                        Poll::Pending
                    } else {
                        Poll::Ready(Err(Error::IOError))
                    }
                }
            },
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::IOError)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRecvFrom for PairSocket {
    fn poll_recv_from(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        let mut receiver_lock_future = self.get_ref().receiver.lock();
        let receiver_lock_future = Pin::new(&mut receiver_lock_future);

        if let Poll::Ready(mut receiver_guard) = receiver_lock_future.poll(cx) {
            let receiver: &mut Receiver<(Vec<u8>, PairSocketAddr)> = &mut receiver_guard;
            match receiver.poll_next_unpin(cx) {
                Poll::Ready(Some((packet, from))) => {
                    let len = packet.len();
                    if buf.len() >= len {
                        buf[..len].copy_from_slice(&packet);
                        Poll::Ready(Ok((len, from)))
                    } else {
                        Poll::Ready(Err(Error::IOError))
                    }
                }
                Poll::Ready(None) => Poll::Ready(Err(Error::IOError)),
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Pending
        }
    }
}
