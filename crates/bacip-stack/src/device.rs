//! What we know about peers, learned from I-Am announcements and held alive
//! by in-flight transactions.

use bacip_core::address::Address;
use bacip_core::object::ObjectId;
use bacip_core::services::i_am::{IAmRequest, Segmentation};
use std::collections::HashMap;

/// Per-peer capabilities. Defaults are the standard's conservative values
/// for a device we have never heard from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: Option<ObjectId>,
    pub address: Address,
    pub max_apdu_length: usize,
    pub segmentation: Segmentation,
    pub vendor_id: Option<u32>,
    pub max_npdu_length: usize,
    pub max_segments: Option<u8>,
}

impl DeviceInfo {
    pub fn unknown(address: Address) -> Self {
        Self {
            device_id: None,
            address,
            max_apdu_length: 1024,
            segmentation: Segmentation::None,
            vendor_id: None,
            max_npdu_length: 1497,
            max_segments: None,
        }
    }
}

#[derive(Debug)]
struct CacheSlot {
    info: DeviceInfo,
    refs: u32,
}

/// Reference-counted peer records, keyed by address and by device instance.
///
/// A record is created on first use or on receipt of an I-Am. Transactions
/// acquire and release it; a release that drops the count to zero evicts the
/// record.
#[derive(Debug, Default)]
pub struct DeviceInfoCache {
    slots: HashMap<Address, CacheSlot>,
    by_instance: HashMap<u32, Address>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<&DeviceInfo> {
        self.slots.get(address).map(|slot| &slot.info)
    }

    pub fn get_by_instance(&self, instance: u32) -> Option<&DeviceInfo> {
        self.by_instance
            .get(&instance)
            .and_then(|addr| self.get(addr))
    }

    /// Snapshot the record for a transaction, creating a default one for an
    /// unknown peer, and hold a reference on it.
    pub fn acquire(&mut self, address: Address) -> DeviceInfo {
        let slot = self
            .slots
            .entry(address)
            .or_insert_with(|| CacheSlot {
                info: DeviceInfo::unknown(address),
                refs: 0,
            });
        slot.refs += 1;
        slot.info.clone()
    }

    /// Drop a transaction's reference; the record goes away with the last one.
    pub fn release(&mut self, address: &Address) {
        let Some(slot) = self.slots.get_mut(address) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            if let Some(id) = self.slots.remove(address).and_then(|s| s.info.device_id) {
                self.by_instance.remove(&id.instance());
            }
        }
    }

    /// Fold an I-Am announcement into the cache.
    pub fn observe_i_am(&mut self, source: Address, i_am: &IAmRequest) {
        let instance = i_am.device_id.instance();

        // The device may have moved; drop a stale record under its old
        // address first.
        if let Some(old_addr) = self.by_instance.get(&instance).copied() {
            if old_addr != source {
                self.slots.remove(&old_addr);
            }
        }

        let slot = self.slots.entry(source).or_insert_with(|| CacheSlot {
            info: DeviceInfo::unknown(source),
            refs: 0,
        });
        slot.info.device_id = Some(i_am.device_id);
        slot.info.max_apdu_length = i_am.max_apdu_length as usize;
        slot.info.segmentation = i_am.segmentation;
        slot.info.vendor_id = Some(i_am.vendor_id);
        self.by_instance.insert(instance, source);
    }

    /// A peer set `segmented-response-accepted` on a request: it can receive
    /// segments whatever it claimed before.
    pub fn note_segmented_response_accepted(&mut self, address: Address) {
        let slot = self.slots.entry(address).or_insert_with(|| CacheSlot {
            info: DeviceInfo::unknown(address),
            refs: 0,
        });
        slot.info.segmentation = match slot.info.segmentation {
            Segmentation::None => Segmentation::Receive,
            Segmentation::Transmit => Segmentation::Both,
            keep => keep,
        };
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceInfoCache;
    use bacip_core::address::{Address, IpPort};
    use bacip_core::object::{ObjectId, ObjectType};
    use bacip_core::services::i_am::{IAmRequest, Segmentation};

    fn peer(last: u8) -> Address {
        Address::local_ip(IpPort::new([10, 0, 0, last], 47808))
    }

    fn i_am(instance: u32) -> IAmRequest {
        IAmRequest {
            device_id: ObjectId::new(ObjectType::Device, instance),
            max_apdu_length: 1476,
            segmentation: Segmentation::Both,
            vendor_id: 15,
        }
    }

    #[test]
    fn i_am_populates_both_indexes() {
        let mut cache = DeviceInfoCache::new();
        cache.observe_i_am(peer(1), &i_am(881000));

        let by_addr = cache.get(&peer(1)).unwrap();
        assert_eq!(by_addr.max_apdu_length, 1476);
        assert_eq!(by_addr.segmentation, Segmentation::Both);
        assert_eq!(by_addr.vendor_id, Some(15));

        let by_id = cache.get_by_instance(881000).unwrap();
        assert_eq!(by_id.address, peer(1));
    }

    #[test]
    fn refcount_evicts_at_zero() {
        let mut cache = DeviceInfoCache::new();
        let info = cache.acquire(peer(2));
        assert_eq!(info.max_apdu_length, 1024);

        let _second = cache.acquire(peer(2));
        cache.release(&peer(2));
        assert!(cache.get(&peer(2)).is_some());
        cache.release(&peer(2));
        assert!(cache.get(&peer(2)).is_none());
    }

    #[test]
    fn moved_device_loses_stale_record() {
        let mut cache = DeviceInfoCache::new();
        cache.observe_i_am(peer(1), &i_am(7));
        cache.observe_i_am(peer(3), &i_am(7));
        assert!(cache.get(&peer(1)).is_none());
        assert_eq!(cache.get_by_instance(7).unwrap().address, peer(3));
    }

    #[test]
    fn segmented_response_accepted_upgrades() {
        let mut cache = DeviceInfoCache::new();
        cache.acquire(peer(4));
        cache.note_segmented_response_accepted(peer(4));
        assert_eq!(cache.get(&peer(4)).unwrap().segmentation, Segmentation::Receive);

        cache.note_segmented_response_accepted(peer(4));
        assert_eq!(cache.get(&peer(4)).unwrap().segmentation, Segmentation::Receive);
    }
}
