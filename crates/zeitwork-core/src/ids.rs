use uuid::Uuid;

/// Generate a new time-ordered (v7) UUID.
///
/// All primary keys are assigned here at the application layer, never by
/// the database. Time-ordering makes row-id comparison a usable tie-break
/// for "newest wins" decisions.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// First 8 hex characters of an id, for embedding in host resource names
/// (TAP devices are capped at 15 chars by the kernel).
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_ids_are_time_ordered() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(b > a);
    }

    #[test]
    fn test_short_id_length() {
        let id = new_id();
        let s = short_id(&id);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_id_is_prefix() {
        let id = new_id();
        assert!(id.simple().to_string().starts_with(&short_id(&id)));
    }
}
