//! NACK and repair-advertisement message assembly.
//!
//! Both message kinds carry the same repair-request payload and drive the
//! same builder protocol:
//!
//! 1. [`RepairRequestContainer::attach_repair_request`] opens a request in
//!    the message, checking that at least a request header still fits;
//! 2. the caller appends items/ranges to the [`RepairRequest`];
//! 3. [`RepairRequestContainer::pack_repair_request`] serializes the request
//!    into the message payload and resets the builder for reuse.
//!
//! `segment_size` caps the assembled payload: a NACK must fit the same
//! datagram budget as a data segment.

use bytes::BytesMut;

use crate::error::WireError;
use crate::repair::{RepairRequest, REPAIR_REQUEST_HEADER_LEN};

/// Messages that can carry repair requests.
pub trait RepairRequestContainer {
    /// Open a fresh repair request in this message.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ExceedsCapacity`] when not even a request header
    /// fits within the `segment_size` payload budget.
    fn attach_repair_request(
        &mut self,
        request: &mut RepairRequest,
        segment_size: u16,
    ) -> Result<(), WireError>;

    /// Serialize the attached request into the message payload and reset the
    /// builder.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ExceedsCapacity`] when header plus items would
    /// overflow the payload budget.
    fn pack_repair_request(&mut self, request: &mut RepairRequest) -> Result<(), WireError>;
}

/// Shared payload assembly for both message kinds.
#[derive(Debug, Default)]
struct RequestCarrier {
    payload: BytesMut,
    capacity: usize,
    request_count: usize,
}

impl RequestCarrier {
    fn attach(&mut self, _request: &mut RepairRequest, segment_size: u16) -> Result<(), WireError> {
        self.capacity = usize::from(segment_size);
        let needed = self.payload.len() + REPAIR_REQUEST_HEADER_LEN;
        if needed > self.capacity {
            return Err(WireError::ExceedsCapacity {
                needed,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn pack(&mut self, request: &mut RepairRequest) -> Result<(), WireError> {
        let needed = self.payload.len() + request.encoded_len();
        if needed > self.capacity {
            return Err(WireError::ExceedsCapacity {
                needed,
                capacity: self.capacity,
            });
        }
        request.encode_into(&mut self.payload);
        request.reset();
        self.request_count += 1;
        Ok(())
    }

    fn requests(&self) -> Result<Vec<RepairRequest>, WireError> {
        let mut requests = Vec::with_capacity(self.request_count);
        let mut rest: &[u8] = &self.payload;
        while !rest.is_empty() {
            let (request, consumed) = RepairRequest::decode(rest)?;
            requests.push(request);
            rest = &rest[consumed..];
        }
        Ok(requests)
    }
}

macro_rules! repair_message {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $name {
            carrier: RequestCarrier,
        }

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            /// Assembled repair-request payload bytes.
            #[must_use]
            pub fn payload(&self) -> &[u8] {
                &self.carrier.payload
            }

            /// Number of packed repair requests.
            #[must_use]
            pub const fn request_count(&self) -> usize {
                self.carrier.request_count
            }

            /// Decode the packed requests back out (receive path / tests).
            ///
            /// # Errors
            ///
            /// Returns `WireError` if the payload is malformed.
            pub fn repair_requests(&self) -> Result<Vec<RepairRequest>, WireError> {
                self.carrier.requests()
            }
        }

        impl RepairRequestContainer for $name {
            fn attach_repair_request(
                &mut self,
                request: &mut RepairRequest,
                segment_size: u16,
            ) -> Result<(), WireError> {
                self.carrier.attach(request, segment_size)
            }

            fn pack_repair_request(
                &mut self,
                request: &mut RepairRequest,
            ) -> Result<(), WireError> {
                self.carrier.pack(request)
            }
        }
    };
}

repair_message! {
    /// A receiver NACK under assembly: the repair requests one receiver
    /// emits for its missing symbols.
    NackMsg
}

repair_message! {
    /// A repair advertisement under assembly: a node's outstanding repair
    /// state, broadcast so other receivers can suppress redundant NACKs.
    RepairAdvMsg
}

#[cfg(test)]
mod tests {
    use norm_core::{BlockId, ObjectId};

    use super::*;
    use crate::repair::{RepairFlags, RepairForm};

    #[test]
    fn attach_append_pack_roundtrip() {
        let mut nack = NackMsg::new();
        let mut request = RepairRequest::new();
        request.set_flag(RepairFlags::SEGMENT);

        nack.attach_repair_request(&mut request, 1024).unwrap();
        request.set_form(RepairForm::Items);
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 5);
        nack.pack_repair_request(&mut request).unwrap();

        assert_eq!(nack.request_count(), 1);
        let decoded = nack.repair_requests().unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].symbol_ids(), vec![5]);
    }

    #[test]
    fn form_order_is_immaterial() {
        // Set the form before attach in one message, after in the other; the
        // wire bytes must match.
        let mut before = RepairAdvMsg::new();
        let mut request = RepairRequest::new();
        request.set_flag(RepairFlags::SEGMENT);
        request.set_form(RepairForm::Items);
        before.attach_repair_request(&mut request, 1024).unwrap();
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 5);
        before.pack_repair_request(&mut request).unwrap();

        let mut after = RepairAdvMsg::new();
        let mut request = RepairRequest::new();
        request.set_flag(RepairFlags::SEGMENT);
        after.attach_repair_request(&mut request, 1024).unwrap();
        request.set_form(RepairForm::Items);
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 5);
        after.pack_repair_request(&mut request).unwrap();

        assert_eq!(before.payload(), after.payload());
    }

    #[test]
    fn attach_rejects_when_payload_budget_spent() {
        let mut nack = NackMsg::new();
        let mut request = RepairRequest::new();
        request.set_flag(RepairFlags::SEGMENT);

        // Budget fits exactly one header + one item.
        nack.attach_repair_request(&mut request, 14).unwrap();
        request.set_form(RepairForm::Items);
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 5);
        nack.pack_repair_request(&mut request).unwrap();

        let err = nack.attach_repair_request(&mut request, 14).unwrap_err();
        assert!(matches!(err, WireError::ExceedsCapacity { .. }));
    }

    #[test]
    fn pack_rejects_oversized_request() {
        let mut nack = NackMsg::new();
        let mut request = RepairRequest::new();
        request.set_flag(RepairFlags::SEGMENT);

        nack.attach_repair_request(&mut request, 20).unwrap();
        request.set_form(RepairForm::Items);
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 5);
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 9);
        let err = nack.pack_repair_request(&mut request).unwrap_err();
        assert!(matches!(
            err,
            WireError::ExceedsCapacity { needed: 24, capacity: 20 }
        ));
    }

    #[test]
    fn multiple_requests_concatenate() {
        let mut adv = RepairAdvMsg::new();
        let mut request = RepairRequest::new();
        request.set_flag(RepairFlags::SEGMENT);

        adv.attach_repair_request(&mut request, 1024).unwrap();
        request.set_form(RepairForm::Items);
        request.append_repair_item(ObjectId::new(1), BlockId::new(2), 16, 3);
        adv.pack_repair_request(&mut request).unwrap();

        adv.attach_repair_request(&mut request, 1024).unwrap();
        request.set_form(RepairForm::Ranges);
        request.append_repair_range(
            crate::RepairItem {
                object_id: ObjectId::new(1),
                block_id: BlockId::new(2),
                num_data: 16,
                symbol_id: 7,
            },
            crate::RepairItem {
                object_id: ObjectId::new(1),
                block_id: BlockId::new(2),
                num_data: 16,
                symbol_id: 10,
            },
        );
        adv.pack_repair_request(&mut request).unwrap();

        let decoded = adv.repair_requests().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].form(), RepairForm::Items);
        assert_eq!(decoded[1].form(), RepairForm::Ranges);
        assert_eq!(decoded[1].symbol_ids(), vec![7, 8, 9, 10]);
    }
}
