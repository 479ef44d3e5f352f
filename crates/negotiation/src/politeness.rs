use beach_dispatch::EndpointId;

/// Which side yields when both peers offer at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rolls back its own offer and answers the remote one.
    Polite,
    /// Ignores colliding remote offers.
    Impolite,
}

impl Role {
    pub fn for_pair(local: &EndpointId, remote: &EndpointId) -> Self {
        if is_polite(local, remote) {
            Role::Polite
        } else {
            Role::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        matches!(self, Role::Polite)
    }
}

/// The lexicographically smaller id is polite. A peer paired with its own id
/// is impolite.
pub fn is_polite(local: &EndpointId, remote: &EndpointId) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_is_polite() {
        let pairs = [("A1", "B2"), ("peer-10", "peer-9"), ("x", "xy"), ("Z", "a")];
        for (left, right) in pairs {
            let left = EndpointId::new(left);
            let right = EndpointId::new(right);
            assert_ne!(is_polite(&left, &right), is_polite(&right, &left));
            assert_ne!(Role::for_pair(&left, &right), Role::for_pair(&right, &left));
        }
    }

    #[test]
    fn smaller_id_yields() {
        assert_eq!(Role::for_pair(&"A1".into(), &"B2".into()), Role::Polite);
        assert_eq!(Role::for_pair(&"B2".into(), &"A1".into()), Role::Impolite);
    }

    #[test]
    fn self_pairing_is_impolite() {
        let id = EndpointId::new("A1");
        assert!(!is_polite(&id, &id));
    }
}
