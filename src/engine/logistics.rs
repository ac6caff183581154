use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::{now_ms, validate_quantity};
use super::{Engine, EngineError};

/// Fold a checkpoint into its consignment: status follows the checkpoint
/// type and a `weigh` with a numeric `quantity` records the actual quantity.
pub(super) fn apply_checkpoint(consignment: &mut Consignment, checkpoint: Checkpoint) {
    if let Some(status) = ConsignmentStatus::after_checkpoint(&checkpoint.kind) {
        consignment.status = status;
    }
    if checkpoint.kind == "weigh"
        && let Some(q) = weighed_quantity(&checkpoint.payload)
    {
        consignment.actual_quantity = Some(q);
    }
    consignment.checkpoints.push(checkpoint);
}

fn weighed_quantity(payload: &str) -> Option<u32> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let q = value.get("quantity")?.as_f64()?;
    (q.is_finite() && q >= 0.0 && q <= u32::MAX as f64).then(|| q.round() as u32)
}

fn created_by(principal: Principal) -> String {
    match principal {
        Principal::Admin => "admin".into(),
        Principal::Grower(id) => id.to_string(),
    }
}

fn validate_kind(kind: &str) -> Result<(), EngineError> {
    if kind.is_empty() || kind.len() > 32 {
        return Err(EngineError::invalid("checkpoint type must be 1 to 32 characters"));
    }
    if !kind.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
        return Err(EngineError::invalid(format!("invalid checkpoint type: {kind}")));
    }
    Ok(())
}

impl Engine {
    pub async fn create_consignment(
        &self,
        principal: Principal,
        req: NewConsignment,
    ) -> Result<(), EngineError> {
        let number = req.number.trim().to_string();
        if number.is_empty() {
            return Err(EngineError::invalid("consignment_number must not be empty"));
        }
        if number.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("consignment_number too long"));
        }
        validate_quantity(req.expected_quantity)?;

        let _gate = self.commit_gate.read().await;
        let _logistics = self.logistics_lock.lock().await;
        if self.consignments.len() >= MAX_CONSIGNMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many consignments"));
        }
        if self.consignments.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists("Consignment", req.id.to_string()));
        }
        if self.consignments.iter().any(|c| c.number == number) {
            return Err(EngineError::AlreadyExists("Consignment", number));
        }

        let grower_id = self
            .confirmed_booking_grower(req.booking_id)
            .await
            .ok_or(EngineError::Missing("Booking not found or not confirmed"))?;
        if !principal.can_act_for(grower_id) {
            return Err(EngineError::Forbidden(
                "Growers can only create consignments for their own bookings",
            ));
        }

        let event = Event::ConsignmentCreated {
            id: req.id,
            booking_id: req.booking_id,
            grower_id,
            number,
            supplier_id: req.supplier_id,
            transporter_id: req.transporter_id,
            expected_quantity: req.expected_quantity,
            created_at: now_ms(),
        };
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    async fn confirmed_booking_grower(&self, booking_id: Ulid) -> Option<Ulid> {
        let slot = self.get_slot(&self.slot_for_booking(&booking_id)?)?;
        let guard = slot.read().await;
        guard
            .booking(booking_id)
            .filter(|b| b.is_confirmed())
            .map(|b| b.grower_id)
    }

    /// Record a checkpoint. Returns the consignment's status afterwards.
    pub async fn record_checkpoint(
        &self,
        principal: Principal,
        id: Ulid,
        consignment_id: Ulid,
        kind: String,
        payload: Option<String>,
    ) -> Result<ConsignmentStatus, EngineError> {
        validate_kind(&kind)?;
        let payload = payload.filter(|p| !p.trim().is_empty()).unwrap_or_else(|| "{}".into());
        if payload.len() > MAX_CHECKPOINT_PAYLOAD_LEN {
            return Err(EngineError::LimitExceeded("checkpoint payload too large"));
        }
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&payload) {
            return Err(EngineError::invalid(format!("invalid checkpoint payload: {e}")));
        }

        let _gate = self.commit_gate.read().await;
        let _logistics = self.logistics_lock.lock().await;
        let (grower_id, count) = self
            .consignments
            .get(&consignment_id)
            .map(|c| (c.grower_id, c.checkpoints.len()))
            .ok_or(EngineError::NotFound("Consignment", consignment_id))?;
        if !principal.can_act_for(grower_id) {
            return Err(EngineError::Forbidden(
                "Growers can only record checkpoints on their own consignments",
            ));
        }
        if count >= MAX_CHECKPOINTS_PER_CONSIGNMENT {
            return Err(EngineError::LimitExceeded("too many checkpoints on consignment"));
        }

        let event = Event::CheckpointRecorded {
            id,
            consignment_id,
            kind,
            at: now_ms(),
            payload,
            created_by: created_by(principal),
        };
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        self.consignments
            .get(&consignment_id)
            .map(|c| c.status)
            .ok_or(EngineError::NotFound("Consignment", consignment_id))
    }

    /// Consignments newest first; growers see only their own. `date` filters
    /// on the booked slot's date.
    pub async fn list_consignments(
        &self,
        principal: Principal,
        date: Option<NaiveDate>,
    ) -> Vec<ConsignmentInfo> {
        let visible: Vec<Consignment> = self
            .consignments
            .iter()
            .filter(|c| principal.can_act_for(c.grower_id))
            .map(|c| c.value().clone())
            .collect();

        let mut out = Vec::with_capacity(visible.len());
        for consignment in visible {
            let slot_date = self.booking_slot_date(consignment.booking_id).await;
            if date.is_some() && slot_date != date {
                continue;
            }
            out.push(ConsignmentInfo { consignment, slot_date });
        }
        out.sort_by(|a, b| {
            b.consignment
                .created_at
                .cmp(&a.consignment.created_at)
                .then(b.consignment.id.cmp(&a.consignment.id))
        });
        out
    }

    async fn booking_slot_date(&self, booking_id: Ulid) -> Option<NaiveDate> {
        let slot = self.get_slot(&self.slot_for_booking(&booking_id)?)?;
        let guard = slot.read().await;
        Some(guard.spec.date)
    }

    /// Checkpoints of one consignment, in the order they were recorded.
    pub fn list_checkpoints(
        &self,
        principal: Principal,
        consignment_id: Ulid,
    ) -> Result<Vec<Checkpoint>, EngineError> {
        let c = self
            .consignments
            .get(&consignment_id)
            .ok_or(EngineError::NotFound("Consignment", consignment_id))?;
        if !principal.can_act_for(c.grower_id) {
            return Err(EngineError::NotFound("Consignment", consignment_id));
        }
        Ok(c.checkpoints.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consignment() -> Consignment {
        Consignment {
            id: Ulid::new(),
            booking_id: Ulid::new(),
            grower_id: Ulid::new(),
            number: "C-1".into(),
            supplier_id: Ulid::new(),
            transporter_id: None,
            expected_quantity: 20,
            actual_quantity: None,
            status: ConsignmentStatus::Pending,
            created_at: 0,
            checkpoints: Vec::new(),
        }
    }

    fn checkpoint(kind: &str, payload: &str) -> Checkpoint {
        Checkpoint {
            id: Ulid::new(),
            kind: kind.into(),
            at: 0,
            payload: payload.into(),
            created_by: "admin".into(),
        }
    }

    #[test]
    fn weigh_sets_actual_quantity_and_status() {
        let mut c = consignment();
        apply_checkpoint(&mut c, checkpoint("weigh", r#"{"quantity": 18.4}"#));
        assert_eq!(c.actual_quantity, Some(18));
        assert_eq!(c.status, ConsignmentStatus::InTransit);
        assert_eq!(c.checkpoints.len(), 1);
    }

    #[test]
    fn weigh_without_numeric_quantity_leaves_actual_unset() {
        let mut c = consignment();
        apply_checkpoint(&mut c, checkpoint("weigh", r#"{"quantity": "lots"}"#));
        assert_eq!(c.actual_quantity, None);
    }

    #[test]
    fn unknown_type_keeps_status() {
        let mut c = consignment();
        apply_checkpoint(&mut c, checkpoint("delivered", "{}"));
        apply_checkpoint(&mut c, checkpoint("photo", "{}"));
        assert_eq!(c.status, ConsignmentStatus::Delivered);
        assert_eq!(c.checkpoints.len(), 2);
    }

    #[test]
    fn checkpoint_type_charset() {
        assert!(validate_kind("quality_check").is_ok());
        assert!(validate_kind("").is_err());
        assert!(validate_kind("Gate In").is_err());
    }
}
