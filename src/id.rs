use uuid::Uuid;

/// Time-ordered identifier used for records created on this device.
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}
