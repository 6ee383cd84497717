//! Remote protocol participants.

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::engine::{Engine, NodeOption};
use crate::error::{NormError, Result};
use crate::handle::{NodeHandle, NodeId};
use crate::protocol::{NackingMode, RepairBoundary};

const ADDRESS_BUF_LEN: usize = 256;

/// A remote sender (or acking receiver) known to a session.
#[derive(Clone)]
pub struct Node {
    handle: NodeHandle,
    engine: Arc<dyn Engine>,
}

impl Node {
    pub(crate) fn new(engine: Arc<dyn Engine>, handle: NodeHandle) -> Self {
        Self { handle, engine }
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn id(&self) -> NodeId {
        self.engine.node_id(self.handle)
    }

    /// Source address the node was last heard from.
    pub fn address(&self) -> Result<SocketAddr> {
        let mut buf = [0u8; ADDRESS_BUF_LEN];
        let (len, port) = self
            .engine
            .node_address(self.handle, &mut buf)
            .ok_or(NormError::Engine("failed to get node address"))?;
        let ip = match len {
            4 => IpAddr::V4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3])),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(NormError::BadAddress(other)),
        };
        Ok(SocketAddr::new(ip, port))
    }

    pub fn grtt(&self) -> f64 {
        self.engine.node_grtt(self.handle)
    }

    /// Copy the most recent application command from this node into `buf`.
    pub fn command(&self, buf: &mut [u8]) -> Result<usize> {
        self.engine
            .node_command(self.handle, buf)
            .ok_or(NormError::Engine("failed to get command"))
    }

    pub fn set_unicast_nack(&self, enable: bool) {
        self.engine
            .set_node_option(self.handle, NodeOption::UnicastNack(enable))
    }

    pub fn set_nacking_mode(&self, mode: NackingMode) {
        self.engine
            .set_node_option(self.handle, NodeOption::NackingMode(mode))
    }

    pub fn set_repair_boundary(&self, boundary: RepairBoundary) {
        self.engine
            .set_node_option(self.handle, NodeOption::RepairBoundary(boundary))
    }

    pub fn set_rx_robust_factor(&self, factor: i32) {
        self.engine
            .set_node_option(self.handle, NodeOption::RxRobustFactor(factor))
    }

    pub fn free_buffers(&self) {
        self.engine.node_free_buffers(self.handle)
    }

    pub fn retain(&self) {
        self.engine.node_retain(self.handle)
    }

    /// # Safety
    ///
    /// Must pair with an earlier [`Node::retain`]; the handle may be reused by
    /// the engine once the last reference is gone.
    pub unsafe fn release(&self) {
        self.engine.node_release(self.handle)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({:?})", self.handle)
    }
}
