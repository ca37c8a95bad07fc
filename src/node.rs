//! One radio with its services
//!
//! A [`Node`] owns a [`Device`], the services registered on it and the TDMA
//! scheduler. Radio events are handed to the services in the order of the
//! interface chain until one claims them. The superframe event is different,
//! every service and the scheduler get it.

use heapless::Vec;

use crate::ccp::Ccp;
use crate::error::Error;
use crate::logging::trace;
use crate::mac::{Device, InterfaceChain, InterfaceId, MacInterface};
use crate::nrng::Nrng;
use crate::pan::{Pan, PanAllocator, TableAllocator};
use crate::radio::Radio;
use crate::rng::Rng;
use crate::rtdoa::Rtdoa;
use crate::survey::Survey;
use crate::tdma::Tdma;


/// A radio and everything running on it
pub struct Node<R, A = TableAllocator> {
    /// The device
    pub dev: Device<R>,
    /// Clock calibration
    pub ccp: Option<Ccp>,
    /// Two-party ranging
    pub rng: Option<Rng>,
    /// Multi-node ranging
    pub nrng: Option<Nrng>,
    /// Reverse TDOA
    pub rtdoa: Option<Rtdoa>,
    /// PAN association
    pub pan: Option<Pan<A>>,
    /// Site survey
    pub survey: Option<Survey>,
    /// Slot scheduler
    pub tdma: Tdma<Node<R, A>>,

    chain: InterfaceChain,
}

impl<R, A> Node<R, A>
    where R: Radio, A: PanAllocator
{
    /// Creates a node without services
    pub fn new(dev: Device<R>) -> Self {
        Node {
            dev,
            ccp: None,
            rng: None,
            nrng: None,
            rtdoa: None,
            pan: None,
            survey: None,
            tdma: Tdma::new(),
            chain: InterfaceChain::new(),
        }
    }

    /// The order services get events in
    pub fn chain(&self) -> &InterfaceChain {
        &self.chain
    }

    /// Registers the clock calibration
    pub fn with_ccp(mut self, ccp: Ccp) -> Result<Self, Error> {
        self.chain.append(InterfaceId::Ccp)?;
        self.ccp = Some(ccp);
        Ok(self)
    }

    /// Registers the two-party ranging
    pub fn with_rng(mut self, rng: Rng) -> Result<Self, Error> {
        self.chain.append(InterfaceId::Rng)?;
        self.rng = Some(rng);
        Ok(self)
    }

    /// Registers the multi-node ranging
    pub fn with_nrng(mut self, nrng: Nrng) -> Result<Self, Error> {
        self.chain.append(InterfaceId::Nrng)?;
        self.nrng = Some(nrng);
        Ok(self)
    }

    /// Registers the reverse TDOA
    pub fn with_rtdoa(mut self, rtdoa: Rtdoa) -> Result<Self, Error> {
        self.chain.append(InterfaceId::Rtdoa)?;
        self.rtdoa = Some(rtdoa);
        Ok(self)
    }

    /// Registers the PAN association
    pub fn with_pan(mut self, pan: Pan<A>) -> Result<Self, Error> {
        self.chain.append(InterfaceId::Pan)?;
        self.pan = Some(pan);
        Ok(self)
    }

    /// Registers the site survey
    pub fn with_survey(mut self, survey: Survey) -> Result<Self, Error> {
        self.chain.append(InterfaceId::Survey)?;
        self.survey = Some(survey);
        Ok(self)
    }

    /// Takes a service off the chain, it no longer gets events
    pub fn unregister(&mut self, id: InterfaceId) -> bool {
        self.chain.remove(id)
    }

    /// A frame was received
    ///
    /// A frame nobody claims doesn't end the receive window it arrived in:
    /// the receiver goes back on for the rest of it, and if the window has
    /// closed in the meantime the services see a receive timeout.
    pub fn rx_complete(&mut self, frame: &[u8]) -> bool {
        let window = self.dev.take_rx_window();
        let claimed = self.dispatch(|service, dev| service.rx_complete(dev, frame));
        if !claimed {
            trace!("node: frame of {} bytes not claimed", frame.len());
            if let Some(window) = window {
                let status = self.dev.resume_rx(window);
                if status.rx_timeout_error || status.start_rx_error {
                    self.dispatch(|service, dev| service.rx_timeout(dev));
                }
            }
        }
        self.after_event();
        claimed
    }

    /// A transmission is done
    pub fn tx_complete(&mut self) -> bool {
        let claimed = self.dispatch(|service, dev| service.tx_complete(dev));
        self.after_event();
        claimed
    }

    /// The receive timeout expired
    pub fn rx_timeout(&mut self) -> bool {
        self.dev.take_rx_window();
        let claimed = self.dispatch(|service, dev| service.rx_timeout(dev));
        self.after_event();
        claimed
    }

    /// A reception failed
    pub fn rx_error(&mut self) -> bool {
        self.dev.take_rx_window();
        let claimed = self.dispatch(|service, dev| service.rx_error(dev));
        self.after_event();
        claimed
    }

    /// A transmission failed
    pub fn tx_error(&mut self) -> bool {
        self.dev.take_rx_window();
        let claimed = self.dispatch(|service, dev| service.tx_error(dev));
        self.after_event();
        claimed
    }

    /// The radio was reset, every service hears about it
    pub fn reset(&mut self) {
        self.dev.stop();
        self.broadcast(|service, dev| {
            service.reset(dev);
        });
    }

    /// Hands an event to the services in chain order until one claims it
    fn dispatch<F>(&mut self, mut f: F) -> bool
        where F: FnMut(&mut dyn MacInterface<R>, &mut Device<R>) -> bool
    {
        let Node { dev, ccp, rng, nrng, rtdoa, pan, survey, chain, .. } = self;
        for id in chain.iter() {
            let service: Option<&mut dyn MacInterface<R>> = match id {
                InterfaceId::Ccp => ccp.as_mut().map(|s| s as &mut dyn MacInterface<R>),
                InterfaceId::Rng => rng.as_mut().map(|s| s as &mut dyn MacInterface<R>),
                InterfaceId::Nrng => nrng.as_mut().map(|s| s as &mut dyn MacInterface<R>),
                InterfaceId::Rtdoa => rtdoa.as_mut().map(|s| s as &mut dyn MacInterface<R>),
                InterfaceId::Pan => pan.as_mut().map(|s| s as &mut dyn MacInterface<R>),
                InterfaceId::Survey => survey.as_mut().map(|s| s as &mut dyn MacInterface<R>),
            };
            if let Some(service) = service {
                if f(service, &mut *dev) {
                    return true;
                }
            }
        }
        false
    }

    /// Hands an event to every service
    fn broadcast<F>(&mut self, mut f: F)
        where F: FnMut(&mut dyn MacInterface<R>, &mut Device<R>)
    {
        self.dispatch(|service, dev| {
            f(service, dev);
            false
        });
    }

    /// Raises the superframe event a service asked for
    fn after_event(&mut self) {
        if !self.dev.take_superframe() {
            return;
        }
        self.broadcast(|service, dev| {
            service.superframe(dev);
        });
        let epoch = self.dev.clock.epoch;
        self.tdma.superframe(&epoch);
    }

    /// Runs everything that is due at platform time `now_us`
    ///
    /// The clock calibration and PAN leases are kept going, then the due
    /// slot callbacks run in slot order. Returns the number of slots run.
    pub fn poll(&mut self, now_us: u64) -> usize {
        if let Some(ccp) = self.ccp.as_mut() {
            ccp.poll(&mut self.dev, now_us);
        }
        if let Some(pan) = self.pan.as_mut() {
            pan.poll(&mut self.dev, now_us);
        }

        let due = self.tdma.poll(now_us);
        for (callback, event) in &due {
            callback(self, event);
        }
        due.len()
    }
}


/// Refers to a node of a [`Registry`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

/// All nodes of a platform, built from the radios found at startup
pub struct Registry<R, const N: usize, A = TableAllocator> {
    nodes: Vec<Node<R, A>, N>,
}

impl<R, A, const N: usize> Registry<R, N, A>
    where R: Radio, A: PanAllocator
{
    /// Creates an empty registry
    pub fn new() -> Self {
        Registry { nodes: Vec::new() }
    }

    /// Adds a node, returns its handle
    pub fn add(&mut self, node: Node<R, A>) -> Result<DeviceHandle, Error> {
        let handle = DeviceHandle(self.nodes.len());
        self.nodes.push(node).map_err(|_| Error::QueueFull)?;
        Ok(handle)
    }

    /// The node behind `handle`
    pub fn get(&self, handle: DeviceHandle) -> Option<&Node<R, A>> {
        self.nodes.get(handle.0)
    }

    /// The node behind `handle`
    pub fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut Node<R, A>> {
        self.nodes.get_mut(handle.0)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if there are no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes with their handles
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DeviceHandle, &mut Node<R, A>)> {
        self.nodes
            .iter_mut()
            .enumerate()
            .map(|(index, node)| (DeviceHandle(index), node))
    }

    /// Polls every node
    pub fn poll(&mut self, now_us: u64) -> usize {
        self.nodes.iter_mut().map(|node| node.poll(now_us)).sum()
    }
}

impl<R, A, const N: usize> Default for Registry<R, N, A>
    where R: Radio, A: PanAllocator
{
    fn default() -> Self {
        Registry::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{CcpConfig, CcpRole, RngConfig, TdmaConfig};
    use crate::rng::Variant;
    use crate::sim::{transfer, SimClock, SimRadio};
    use crate::tdma::SlotEvent;

    fn device(short_address: u16) -> Device<SimRadio> {
        Device::new(SimRadio::new(SimClock::default()), short_address as u64, short_address)
    }

    fn ccp(role: CcpRole) -> Ccp {
        Ccp::new(CcpConfig { role, ..CcpConfig::default() })
    }

    fn range_to_anchor(node: &mut Node<SimRadio>, _: &SlotEvent) {
        if let Some(rng) = node.rng.as_mut() {
            let _ = rng.request(&mut node.dev, 0x0001, Variant::DoubleSided);
        }
    }

    #[test]
    fn services_are_asked_in_chain_order() {
        let mut master: Node<SimRadio> = Node::new(device(0x0001)).with_ccp(ccp(CcpRole::Master)).unwrap();
        let mut tag: Node<SimRadio> = Node::new(device(0x0002))
            .with_rng(Rng::new(RngConfig::default()))
            .unwrap()
            .with_ccp(ccp(CcpRole::Slave))
            .unwrap();
        assert_eq!(tag.chain().iter().collect::<heapless::Vec<_, 8>>(), [InterfaceId::Rng, InterfaceId::Ccp]);

        tag.rng.as_mut().unwrap().listen(&mut tag.dev, 0).unwrap();
        assert!(tag.ccp.as_mut().unwrap().start(&mut tag.dev));
        assert!(master.ccp.as_mut().unwrap().start(&mut master.dev));

        assert!(transfer(&mut master, &mut tag, 100));
        assert_eq!(tag.ccp.as_ref().unwrap().rx_count(), 1);
        assert_eq!(tag.rng.as_ref().unwrap().stats.rx_complete, 0);
        assert_eq!(tag.rng.as_ref().unwrap().sem_count(), 0);
    }

    #[test]
    fn unregistered_services_get_nothing() {
        let mut master: Node<SimRadio> = Node::new(device(0x0001)).with_ccp(ccp(CcpRole::Master)).unwrap();
        let mut slave: Node<SimRadio> = Node::new(device(0x0002)).with_ccp(ccp(CcpRole::Slave)).unwrap();
        assert!(slave.ccp.as_mut().unwrap().start(&mut slave.dev));
        assert!(master.ccp.as_mut().unwrap().start(&mut master.dev));

        assert!(slave.unregister(InterfaceId::Ccp));
        assert!(!slave.unregister(InterfaceId::Ccp));
        assert!(!transfer(&mut master, &mut slave, 100));
        assert_eq!(slave.ccp.as_ref().unwrap().rx_count(), 0);
    }

    #[test]
    fn superframe_arms_the_slots() {
        let mut master: Node<SimRadio> = Node::new(device(0x0002))
            .with_ccp(ccp(CcpRole::Master))
            .unwrap()
            .with_rng(Rng::new(RngConfig::default()))
            .unwrap();
        master.tdma.init(TdmaConfig::default()).unwrap();
        master.tdma.assign_slot(3, range_to_anchor).unwrap();

        assert!(master.ccp.as_mut().unwrap().start(&mut master.dev));
        master.dev.radio.take_frame();
        assert!(master.tx_complete());
        assert_eq!(master.tdma.stats.superframe, 1);
        assert_eq!(master.tdma.epoch().seq, 1);

        let slot = master.tdma.slot_start_us(3);
        assert_eq!(master.poll(slot - 200), 0);
        assert_eq!(master.poll(slot), 1);
        assert_eq!(master.rng.as_ref().unwrap().sem_count(), 0);
        assert_eq!(master.poll(slot + 10), 0);
    }

    #[test]
    fn reset_reaches_every_service() {
        let mut node: Node<SimRadio> = Node::new(device(0x0001))
            .with_rng(Rng::new(RngConfig::default()))
            .unwrap()
            .with_ccp(ccp(CcpRole::Slave))
            .unwrap();
        node.rng.as_mut().unwrap().listen(&mut node.dev, 0).unwrap();
        node.reset();

        assert!(node.rng.as_ref().unwrap().status().aborted);
        assert_eq!(node.rng.as_ref().unwrap().stats.reset, 1);
        assert_eq!(node.ccp.as_ref().unwrap().stats.reset, 1);
        assert!(!node.dev.radio.rx_enabled);
    }

    #[test]
    fn registry_hands_out_handles() {
        let mut registry: Registry<SimRadio, 2> = Registry::new();
        let first = registry.add(Node::new(device(0x0001))).unwrap();
        let second = registry.add(Node::new(device(0x0002))).unwrap();
        assert_eq!(registry.add(Node::new(device(0x0003))).err(), Some(Error::QueueFull));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(first).map(|node| node.dev.short_address.0), Some(0x0001));
        assert_eq!(registry.get_mut(second).map(|node| node.dev.short_address.0), Some(0x0002));
        assert!(registry.get(DeviceHandle(2)).is_none());
        assert_eq!(registry.poll(0), 0);
    }
}
