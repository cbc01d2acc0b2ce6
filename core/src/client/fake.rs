//! In-memory transport used by the client unit tests

use super::transport::{
    ChannelStatus, DataChannel, PeerTransport, TransportError, TransportFactory,
};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::relay::IceServer;
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct FakeLog {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub applied: Vec<IceCandidate>,
    pub rejected_candidates: HashSet<String>,
    pub fail_offer: bool,
    pub closed: bool,
    pub channels_created: usize,
}

#[derive(Clone)]
pub struct FakeChannel {
    pub status: Rc<Cell<ChannelStatus>>,
    pub sent: Rc<RefCell<Vec<String>>>,
}

impl FakeChannel {
    pub fn new(status: ChannelStatus) -> Self {
        Self {
            status: Rc::new(Cell::new(status)),
            sent: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        "datachannel".to_string()
    }

    fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.status.get() != ChannelStatus::Ready {
            return Err(TransportError::Channel("not open".to_string()));
        }
        self.sent.borrow_mut().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.status.set(ChannelStatus::Closed);
    }
}

pub struct FakeTransport {
    pub name: String,
    pub log: Rc<RefCell<FakeLog>>,
    pub channel: FakeChannel,
}

impl FakeTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: Rc::new(RefCell::new(FakeLog::default())),
            channel: FakeChannel::new(ChannelStatus::Pending),
        }
    }
}

#[async_trait(?Send)]
impl PeerTransport for FakeTransport {
    type Channel = FakeChannel;

    fn create_data_channel(&mut self, _label: &str) -> Result<FakeChannel, TransportError> {
        self.log.borrow_mut().channels_created += 1;
        Ok(self.channel.clone())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.log.borrow().fail_offer {
            return Err(TransportError::Negotiation("offer refused".to_string()));
        }
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.name)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.name)))
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.log.borrow_mut().local = Some(description.clone());
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.log.borrow_mut().remote = Some(description.clone());
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut log = self.log.borrow_mut();
        if log.remote.is_none() {
            return Err(TransportError::Candidate("no remote description".to_string()));
        }
        if log.rejected_candidates.contains(&candidate.candidate) {
            return Err(TransportError::Candidate(candidate.candidate.clone()));
        }
        log.applied.push(candidate.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.log.borrow_mut().closed = true;
    }
}

/// Hands out fake transports and remembers their logs by peer name
#[derive(Default)]
pub struct FakeFactory {
    pub logs: HashMap<String, Rc<RefCell<FakeLog>>>,
    pub channels: HashMap<String, FakeChannel>,
    pub ice_servers_seen: Vec<usize>,
}

impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    fn create(
        &mut self,
        peer: &str,
        ice_servers: &[IceServer],
    ) -> Result<FakeTransport, TransportError> {
        let transport = FakeTransport::new(peer);
        self.logs.insert(peer.to_string(), transport.log.clone());
        self.channels.insert(peer.to_string(), transport.channel.clone());
        self.ice_servers_seen.push(ice_servers.len());
        Ok(transport)
    }
}
