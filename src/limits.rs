// Hard caps that keep one tenant (or one statement) from exhausting the process.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SLOTS_PER_TENANT: usize = 250_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 1_000;
pub const MAX_GROWERS_PER_TENANT: usize = 100_000;
pub const MAX_CULTIVARS_PER_TENANT: usize = 10_000;
pub const MAX_TEMPLATES_PER_TENANT: usize = 1_000;
pub const MAX_CONSIGNMENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_CHECKPOINTS_PER_CONSIGNMENT: usize = 256;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_048;
pub const MAX_RESOURCE_UNIT_LEN: usize = 32;
pub const MAX_TEMPLATE_CONFIG_LEN: usize = 64 * 1024;
pub const MAX_CHECKPOINT_PAYLOAD_LEN: usize = 16 * 1024;
pub const MAX_RESTRICTION_IDS: usize = 1_000;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Bulk creation, blackouts and template applies.
pub const MAX_BULK_RANGE_DAYS: i64 = 365;
/// `slots` range listing.
pub const MAX_SLOT_RANGE_DAYS: i64 = 14;
pub const MAX_EXPORT_RANGE_DAYS: i64 = 366;
pub const MAX_SLOTS_PER_APPLY: usize = 50_000;

pub const DEFAULT_NEXT_AVAILABLE: usize = 10;
pub const MAX_NEXT_AVAILABLE: usize = 100;

pub const MAX_OUTBOX_EVENTS: usize = 10_000;
