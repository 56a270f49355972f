//! GATT object tree and the resolver that assembles it from raw discovery results.
//!
//! Transports report services, characteristics and descriptors as flat lists in
//! whatever order the native stack produced them. `GattTree::assemble` turns
//! those lists into a tree: a characteristic belongs to the service the native
//! stack names directly, otherwise to the first service (by handle) whose range
//! contains its handle. Characteristics that fit nowhere are kept aside as
//! orphans instead of being dropped silently.

use std::collections::HashMap;

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::transport::{
    HandleRange, RawCharacteristic, RawDescriptor, RawService, Transport,
};
use crate::core::bluetooth::types::{CharacteristicProperties, CharacteristicRef};
use crate::error::{BleError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
    pub characteristic_handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub handle: u16,
    pub properties: CharacteristicProperties,
    pub service_handle: u16,
    pub service_uuid: Uuid,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| &d.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub uuid: Uuid,
    pub handle: u16,
    pub range: Option<HandleRange>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    fn contains(&self, handle: u16) -> bool {
        self.range.is_some_and(|range| range.contains(handle))
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// A characteristic that matched no discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub uuid: Uuid,
    pub handle: u16,
    pub claimed_service: Option<u16>,
}

/// The resolved services of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GattTree {
    services: Vec<Service>,
    orphans: Vec<Orphan>,
    orphan_descriptors: Vec<u16>,
    /// characteristic handle -> (service index, characteristic index)
    #[serde(skip)]
    index: HashMap<u16, (usize, usize)>,
}

impl GattTree {
    /// Builds a tree from raw discovery lists. The result does not depend on
    /// the order of the input lists.
    pub fn assemble(
        mut services: Vec<RawService>,
        mut characteristics: Vec<RawCharacteristic>,
        mut descriptors: Vec<RawDescriptor>,
    ) -> Self {
        services.sort_by_key(|s| (s.handle, s.range));
        services.dedup_by_key(|s| s.handle);
        characteristics.sort_by_key(|c| c.handle);
        descriptors.sort_by_key(|d| d.handle);

        let mut tree = GattTree {
            services: services
                .into_iter()
                .map(|s| Service {
                    uuid: s.uuid,
                    handle: s.handle,
                    range: s.range,
                    characteristics: Vec::new(),
                })
                .collect(),
            ..Default::default()
        };

        for raw in characteristics {
            let owner = match raw.service_handle {
                Some(service_handle) => tree.services.iter().position(|s| s.handle == service_handle),
                None => tree.services.iter().position(|s| s.contains(raw.handle)),
            };
            match owner {
                Some(service_idx) => {
                    let service = &mut tree.services[service_idx];
                    debug!(
                        "Characteristic {} (0x{:04x}) attached to service {}",
                        raw.uuid, raw.handle, service.uuid
                    );
                    service.characteristics.push(Characteristic {
                        uuid: raw.uuid,
                        handle: raw.handle,
                        properties: raw.properties,
                        service_handle: service.handle,
                        service_uuid: service.uuid,
                        descriptors: Vec::new(),
                    });
                }
                None => {
                    warn!(
                        "Characteristic was not associated with any service. ({}, 0x{:04x})",
                        raw.uuid, raw.handle
                    );
                    tree.orphans.push(Orphan {
                        uuid: raw.uuid,
                        handle: raw.handle,
                        claimed_service: raw.service_handle,
                    });
                }
            }
        }
        tree.rebuild_index();

        for raw in descriptors {
            let owner = match raw.characteristic_handle {
                Some(handle) => tree.index.get(&handle).copied(),
                None => tree.preceding_characteristic(raw.handle),
            };
            match owner {
                Some((s, c)) => {
                    let characteristic = &mut tree.services[s].characteristics[c];
                    characteristic.descriptors.push(Descriptor {
                        uuid: raw.uuid,
                        handle: raw.handle,
                        characteristic_handle: characteristic.handle,
                    });
                }
                None => {
                    warn!("Descriptor {} (0x{:04x}) has no owning characteristic", raw.uuid, raw.handle);
                    tree.orphan_descriptors.push(raw.handle);
                }
            }
        }

        tree
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (s, service) in self.services.iter().enumerate() {
            for (c, characteristic) in service.characteristics.iter().enumerate() {
                self.index.insert(characteristic.handle, (s, c));
            }
        }
    }

    /// The characteristic with the greatest handle below `handle` in the
    /// service that contains it. Used when a stack only reports descriptor
    /// handles.
    fn preceding_characteristic(&self, handle: u16) -> Option<(usize, usize)> {
        let (s, service) = self
            .services
            .iter()
            .enumerate()
            .find(|(_, service)| service.contains(handle))?;
        service
            .characteristics
            .iter()
            .enumerate()
            .filter(|(_, c)| c.handle < handle)
            .max_by_key(|(_, c)| c.handle)
            .map(|(c, _)| (s, c))
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn orphans(&self) -> &[Orphan] {
        &self.orphans
    }

    pub fn orphan_descriptors(&self) -> &[u16] {
        &self.orphan_descriptors
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    pub fn characteristic_by_handle(&self, handle: u16) -> Option<&Characteristic> {
        self.index
            .get(&handle)
            .map(|&(s, c)| &self.services[s].characteristics[c])
    }

    /// Resolves a caller reference. UUID lookups return the lowest handle
    /// carrying that UUID.
    pub fn find(&self, reference: CharacteristicRef) -> Result<&Characteristic> {
        let found = match reference {
            CharacteristicRef::Handle(handle) => self.characteristic_by_handle(handle),
            CharacteristicRef::Uuid(uuid) => {
                let mut matches = self.characteristics().filter(|c| c.uuid == uuid);
                let first = matches.next();
                if first.is_some() && matches.next().is_some() {
                    debug!("Several characteristics share uuid {}, using the lowest handle", uuid);
                }
                first
            }
        };
        found.ok_or_else(|| BleError::NotFound(format!("characteristic {}", reference)))
    }

    pub fn descriptor_by_handle(&self, handle: u16) -> Option<&Descriptor> {
        self.characteristics()
            .flat_map(|c| c.descriptors.iter())
            .find(|d| d.handle == handle)
    }
}

/// Runs discovery against a transport and assembles the tree.
pub struct TreeResolver;

impl TreeResolver {
    /// Services first, then all characteristics in one bulk call, then
    /// descriptors where the transport supports them.
    pub async fn resolve(transport: &dyn Transport) -> Result<GattTree> {
        let services = transport.discover_services().await.map_err(into_discovery)?;
        info!("Discovered {} services via {}", services.len(), transport.name());

        let characteristics = transport
            .discover_characteristics()
            .await
            .map_err(into_discovery)?;
        info!("Discovered {} characteristics", characteristics.len());

        let descriptors = if transport.capabilities().descriptors {
            match transport.discover_descriptors().await {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    warn!("Descriptor discovery failed, continuing without descriptors: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let tree = GattTree::assemble(services, characteristics, descriptors);
        if !tree.orphans().is_empty() {
            warn!("{} characteristics excluded from the tree", tree.orphans().len());
        }
        Ok(tree)
    }
}

fn into_discovery(e: BleError) -> BleError {
    match e {
        BleError::Discovery(_) | BleError::NotConnected | BleError::Timeout => e,
        other => BleError::Discovery(other.to_string()),
    }
}
