//! The payload of a device write.

/// Data for a single write to a single device. The action names an
/// operation the device's handler understands ("color", "state"); the
/// raw data bytes are decoded by the handler itself. The transaction
/// id is attached by the framework when the write is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteData {
    pub action: String,
    pub data: Vec<u8>,
    pub transaction: Option<String>,
}

impl WriteData {
    pub fn new(action: &str, data: &[u8]) -> WriteData {
        WriteData {
            action: action.into(),
            data: data.to_vec(),
            transaction: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_data() {
        let w = WriteData::new("state", b"on");

        assert_eq!(w.action, "state");
        assert_eq!(w.data, b"on".to_vec());
        assert!(w.transaction.is_none());
    }
}
