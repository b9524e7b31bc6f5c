/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use core::fmt::{self, Display};

/// A peer address. The core is transport-agnostic; addresses are opaque
/// route handles it matches and echoes, nothing more.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
pub enum Address {
    #[cfg(feature = "std")]
    Udp(std::net::SocketAddr),
    /// An opaque peer handle for transports without socket addressing
    /// (BLE connections, loopback test harnesses).
    Conn(u32),
}

impl Address {
    pub const fn unspecified() -> Self {
        Self::Conn(0)
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "std")]
            Address::Udp(addr) => write!(f, "UDP {}", addr),
            Address::Conn(id) => write!(f, "CONN {}", id),
        }
    }
}

/// Asynchronous datagram send, implemented by the embedder's network glue.
pub trait NetSend {
    async fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), crate::error::Error>;
}

/// Asynchronous datagram receive, implemented by the embedder's network glue.
pub trait NetRecv {
    /// Receive one datagram into `buf`, returning its length and origin.
    async fn recv_from(&mut self, buf: &mut [u8])
        -> Result<(usize, Address), crate::error::Error>;
}
