//! Cached GATT hierarchy of one peripheral.

use uuid::Uuid;

use crate::native::{NativeAttribute, NativeCharacteristic};
use crate::registry::{AttrId, IdAllocator, NotFound, Registry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: AttrId,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub id: AttrId,
    pub uuid: Uuid,
    /// GATT characteristic property bits, see [`crate::common::properties`].
    pub properties: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub id: AttrId,
    pub uuid: Uuid,
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceNode {
    uuid: Uuid,
    characteristics: Vec<AttrId>,
}

#[derive(Debug, Clone)]
pub(crate) struct CharacteristicNode {
    uuid: Uuid,
    properties: u8,
    descriptors: Vec<AttrId>,
}

#[derive(Debug, Clone)]
pub(crate) struct DescriptorNode {
    uuid: Uuid,
}

/// Services, characteristics and descriptors keyed by opaque identifiers.
///
/// Each tier keeps discovery order. Rebuilding a tier invalidates every
/// identifier beneath the rebuilt parent before minting the new set.
#[derive(Debug)]
pub(crate) struct AttributeTree<S, C, D> {
    order: Vec<AttrId>,
    services: Registry<S, ServiceNode>,
    characteristics: Registry<C, CharacteristicNode>,
    descriptors: Registry<D, DescriptorNode>,
}

impl<S, C, D> Default for AttributeTree<S, C, D> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            services: Registry::default(),
            characteristics: Registry::default(),
            descriptors: Registry::default(),
        }
    }
}

impl<S, C, D> AttributeTree<S, C, D>
where
    S: Clone + Ord,
    C: Clone + Ord,
    D: Clone + Ord,
{
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn replace_services(
        &mut self,
        ids: &mut IdAllocator,
        discovered: Vec<NativeAttribute<S>>,
    ) -> Vec<Service> {
        for id in std::mem::take(&mut self.order) {
            self.drop_service(id);
        }

        for attr in discovered {
            let id = self.services.mint(
                ids,
                attr.handle,
                ServiceNode {
                    uuid: attr.uuid,
                    characteristics: Vec::new(),
                },
            );
            if !self.order.contains(&id) {
                self.order.push(id);
            }
        }

        self.services()
    }

    pub(crate) fn replace_characteristics(
        &mut self,
        ids: &mut IdAllocator,
        service: AttrId,
        discovered: Vec<NativeCharacteristic<C>>,
    ) -> Result<Vec<Characteristic>, NotFound> {
        let old = std::mem::take(&mut self.services.get_mut(service)?.value.characteristics);
        for id in old {
            self.drop_characteristic(id);
        }

        let mut minted = Vec::with_capacity(discovered.len());
        for chr in discovered {
            let id = self.characteristics.mint(
                ids,
                chr.handle,
                CharacteristicNode {
                    uuid: chr.uuid,
                    properties: chr.properties,
                    descriptors: Vec::new(),
                },
            );
            if !minted.contains(&id) {
                minted.push(id);
            }
        }
        self.services.get_mut(service)?.value.characteristics = minted;

        self.characteristics(service)
    }

    pub(crate) fn replace_descriptors(
        &mut self,
        ids: &mut IdAllocator,
        characteristic: AttrId,
        discovered: Vec<NativeAttribute<D>>,
    ) -> Result<Vec<Descriptor>, NotFound> {
        let old = std::mem::take(
            &mut self
                .characteristics
                .get_mut(characteristic)?
                .value
                .descriptors,
        );
        for id in old {
            self.descriptors.invalidate(id);
        }

        let mut minted = Vec::with_capacity(discovered.len());
        for dsc in discovered {
            let id = self
                .descriptors
                .mint(ids, dsc.handle, DescriptorNode { uuid: dsc.uuid });
            if !minted.contains(&id) {
                minted.push(id);
            }
        }
        self.characteristics
            .get_mut(characteristic)?
            .value
            .descriptors = minted;

        self.descriptors(characteristic)
    }

    fn drop_service(&mut self, id: AttrId) {
        if let Some(slot) = self.services.invalidate(id) {
            for chr in slot.value.characteristics {
                self.drop_characteristic(chr);
            }
        }
    }

    fn drop_characteristic(&mut self, id: AttrId) {
        if let Some(slot) = self.characteristics.invalidate(id) {
            for dsc in slot.value.descriptors {
                self.descriptors.invalidate(dsc);
            }
        }
    }

    pub(crate) fn service(&self, id: AttrId) -> Result<(&S, Uuid), NotFound> {
        let slot = self.services.get(id)?;
        Ok((&slot.handle, slot.value.uuid))
    }

    pub(crate) fn characteristic(&self, id: AttrId) -> Result<(&C, Uuid), NotFound> {
        let slot = self.characteristics.get(id)?;
        Ok((&slot.handle, slot.value.uuid))
    }

    pub(crate) fn descriptor(&self, id: AttrId) -> Result<(&D, Uuid), NotFound> {
        let slot = self.descriptors.get(id)?;
        Ok((&slot.handle, slot.value.uuid))
    }

    pub(crate) fn service_id(&self, handle: &S) -> Option<AttrId> {
        self.services.id_of(handle)
    }

    pub(crate) fn characteristic_id(&self, handle: &C) -> Option<AttrId> {
        self.characteristics.id_of(handle)
    }

    pub(crate) fn services(&self) -> Vec<Service> {
        self.order
            .iter()
            .filter_map(|&id| {
                let slot = self.services.get(id).ok()?;
                Some(Service {
                    id,
                    uuid: slot.value.uuid,
                })
            })
            .collect()
    }

    pub(crate) fn characteristics(&self, service: AttrId) -> Result<Vec<Characteristic>, NotFound> {
        let node = &self.services.get(service)?.value;

        Ok(node
            .characteristics
            .iter()
            .filter_map(|&id| {
                let slot = self.characteristics.get(id).ok()?;
                Some(Characteristic {
                    id,
                    uuid: slot.value.uuid,
                    properties: slot.value.properties,
                })
            })
            .collect())
    }

    pub(crate) fn descriptors(&self, characteristic: AttrId) -> Result<Vec<Descriptor>, NotFound> {
        let node = &self.characteristics.get(characteristic)?.value;

        Ok(node
            .descriptors
            .iter()
            .filter_map(|&id| {
                let slot = self.descriptors.get(id).ok()?;
                Some(Descriptor {
                    id,
                    uuid: slot.value.uuid,
                })
            })
            .collect())
    }
}
