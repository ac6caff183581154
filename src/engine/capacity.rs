use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Can `quantity` of `grower_id`'s produce go into `slot`?
///
/// `exclude` leaves one existing booking out of the booked total (a booking
/// being resized in place). `moving` selects the messages used for moves.
pub(super) fn check_admission(
    slot: &SlotState,
    grower_id: Ulid,
    cultivar_id: Option<Ulid>,
    quantity: u32,
    exclude: Option<Ulid>,
    moving: bool,
) -> Result<(), EngineError> {
    if slot.spec.blackout {
        return Err(EngineError::Blackout(if moving {
            "Cannot move to blacked out slot"
        } else {
            "Slot is blacked out"
        }));
    }
    if !slot.admits_grower(grower_id) {
        return Err(EngineError::Restricted("Grower is not allowed to book this slot"));
    }
    if !slot.admits_cultivar(cultivar_id) {
        return Err(EngineError::Restricted("Cultivar is not allowed in this slot"));
    }
    let available = slot.spec.capacity.saturating_sub(slot.booked_excluding(exclude));
    if quantity > available {
        return Err(EngineError::InsufficientCapacity {
            available,
            requested: quantity,
            moving,
        });
    }
    if exclude.is_none()
        && slot.bookings.iter().filter(|b| b.is_confirmed()).count() >= MAX_BOOKINGS_PER_SLOT
    {
        return Err(EngineError::LimitExceeded("too many bookings on slot"));
    }
    Ok(())
}

pub(super) fn validate_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::invalid("quantity must be greater than 0"));
    }
    Ok(())
}

/// A slot's capacity may never drop below what is already booked on it.
pub(super) fn validate_capacity_change(slot: &SlotState, capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::invalid("capacity must be greater than 0"));
    }
    let booked = slot.booked();
    if capacity < booked {
        return Err(EngineError::CapacityBelowBooked { capacity, booked });
    }
    Ok(())
}

pub(super) fn validate_spec(spec: &SlotSpec) -> Result<(), EngineError> {
    if spec.end_time <= spec.start_time {
        return Err(EngineError::invalid("end_time must be after start_time"));
    }
    if spec.capacity == 0 {
        return Err(EngineError::invalid("capacity must be greater than 0"));
    }
    if spec.resource_unit.trim().is_empty() {
        return Err(EngineError::invalid("resource_unit must not be empty"));
    }
    if spec.resource_unit.len() > MAX_RESOURCE_UNIT_LEN {
        return Err(EngineError::LimitExceeded("resource_unit too long"));
    }
    validate_notes(spec.notes.as_deref())
}

pub(super) fn validate_password(password: &str) -> Result<(), EngineError> {
    if password.is_empty() {
        return Err(EngineError::invalid("password must not be empty"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::LimitExceeded("password too long"));
    }
    Ok(())
}

pub(super) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(super) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn slot(capacity: u32) -> SlotState {
        SlotState::new(
            Ulid::new(),
            SlotSpec {
                date: NaiveDate::from_ymd_opt(2031, 3, 3).unwrap(),
                start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                capacity,
                resource_unit: "tons".into(),
                blackout: false,
                notes: None,
            },
        )
    }

    fn confirmed(slot: &mut SlotState, quantity: u32) -> Ulid {
        let id = Ulid::new();
        slot.bookings.push(Booking {
            id,
            grower_id: Ulid::new(),
            cultivar_id: None,
            quantity,
            status: BookingStatus::Confirmed,
            created_at: 0,
            notes: None,
        });
        id
    }

    #[test]
    fn capacity_message_reports_available_and_requested() {
        let mut s = slot(10);
        confirmed(&mut s, 7);
        let err = check_admission(&s, Ulid::new(), None, 4, None, false).unwrap_err();
        assert_eq!(err.to_string(), "Insufficient capacity. Available: 3, Requested: 4");
        assert!(check_admission(&s, Ulid::new(), None, 3, None, false).is_ok());
    }

    #[test]
    fn resize_in_place_excludes_itself() {
        let mut s = slot(10);
        let own = confirmed(&mut s, 6);
        confirmed(&mut s, 3);
        assert!(check_admission(&s, Ulid::new(), None, 7, Some(own), false).is_ok());
        assert!(check_admission(&s, Ulid::new(), None, 8, Some(own), false).is_err());
    }

    #[test]
    fn blackout_checked_before_capacity() {
        let mut s = slot(10);
        s.spec.blackout = true;
        assert_eq!(
            check_admission(&s, Ulid::new(), None, 1, None, true).unwrap_err(),
            EngineError::Blackout("Cannot move to blacked out slot")
        );
    }

    #[test]
    fn move_uses_target_message() {
        let mut s = slot(2);
        confirmed(&mut s, 2);
        let err = check_admission(&s, Ulid::new(), None, 1, None, true).unwrap_err();
        assert!(err.to_string().starts_with("Target slot at capacity"));
    }

    #[test]
    fn grower_allowlist() {
        let mut s = slot(10);
        let allowed = Ulid::new();
        s.allowed_growers.insert(allowed);
        assert!(check_admission(&s, allowed, None, 1, None, false).is_ok());
        assert!(matches!(
            check_admission(&s, Ulid::new(), None, 1, None, false),
            Err(EngineError::Restricted(_))
        ));
    }

    #[test]
    fn cancelled_bookings_do_not_count_toward_booking_cap() {
        let mut s = slot(u32::MAX);
        for _ in 0..MAX_BOOKINGS_PER_SLOT {
            confirmed(&mut s, 1);
        }
        assert_eq!(
            check_admission(&s, Ulid::new(), None, 1, None, false).unwrap_err(),
            EngineError::LimitExceeded("too many bookings on slot")
        );

        s.bookings[0].status = BookingStatus::Cancelled;
        assert!(check_admission(&s, Ulid::new(), None, 1, None, false).is_ok());
    }

    #[test]
    fn capacity_cannot_drop_below_booked() {
        let mut s = slot(10);
        confirmed(&mut s, 6);
        assert!(validate_capacity_change(&s, 6).is_ok());
        assert_eq!(
            validate_capacity_change(&s, 5).unwrap_err(),
            EngineError::CapacityBelowBooked { capacity: 5, booked: 6 }
        );
        assert!(validate_capacity_change(&s, 0).is_err());
    }
}
