//! Per-value validity flag.

/// Whether a buffer's contents should be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataValidity {
    #[default]
    Ok,
    Faulty,
}

impl DataValidity {
    pub fn is_ok(self) -> bool {
        matches!(self, DataValidity::Ok)
    }

    pub fn is_faulty(self) -> bool {
        matches!(self, DataValidity::Faulty)
    }

    /// Combines validity from multiple contributing inputs: faulty
    /// dominates, matching the "propagate the worst" rule decorators
    /// must follow.
    pub fn worst_of(self, other: DataValidity) -> DataValidity {
        if self.is_faulty() || other.is_faulty() {
            DataValidity::Faulty
        } else {
            DataValidity::Ok
        }
    }

    pub fn worst_of_iter(iter: impl IntoIterator<Item = DataValidity>) -> DataValidity {
        iter.into_iter()
            .fold(DataValidity::Ok, DataValidity::worst_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulty_dominates() {
        assert_eq!(
            DataValidity::Ok.worst_of(DataValidity::Faulty),
            DataValidity::Faulty
        );
        assert_eq!(
            DataValidity::Faulty.worst_of(DataValidity::Ok),
            DataValidity::Faulty
        );
        assert_eq!(
            DataValidity::Ok.worst_of(DataValidity::Ok),
            DataValidity::Ok
        );
    }

    #[test]
    fn worst_of_iter_empty_is_ok() {
        assert_eq!(DataValidity::worst_of_iter(vec![]), DataValidity::Ok);
    }
}
