use crate::signature::{arg_count, iter_args, since_version, ArgKind};

/// Static description of one message (a request or an event) of an
/// interface: its name, signature, and — for `o`/`n` arguments — the
/// interface each referenced object must implement.
#[derive(Debug)]
pub struct MessageDesc {
    pub name: &'static str,
    pub signature: &'static str,
    /// One entry per argument; `Some` only for object-typed slots with a
    /// statically known interface.
    pub arg_interfaces: &'static [Option<&'static Interface>],
}

impl MessageDesc {
    pub fn arg_count(&self) -> usize {
        arg_count(self.signature)
    }

    /// Interface version that introduced this message.
    pub fn since(&self) -> u32 {
        since_version(self.signature)
    }

    /// Number of file descriptor arguments this message carries.
    pub fn fd_count(&self) -> usize {
        iter_args(self.signature)
            .filter(|spec| spec.kind == ArgKind::Fd)
            .count()
    }
}

/// Static description of a protocol interface: the typed registry that
/// drives marshaling and object resolution for every object implementing it.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    pub version: u32,
    pub requests: &'static [MessageDesc],
    pub events: &'static [MessageDesc],
}

impl Interface {
    /// Two interface descriptors denote the same protocol interface.
    ///
    /// Pointer equality is the fast path; name comparison covers descriptors
    /// duplicated across compilation units.
    pub fn same_as(&self, other: &Interface) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_MESSAGES: [MessageDesc; 2] = [
        MessageDesc {
            name: "create",
            signature: "n",
            arg_interfaces: &[None],
        },
        MessageDesc {
            name: "attach",
            signature: "3?ohu",
            arg_interfaces: &[None, None, None],
        },
    ];

    static TEST_INTERFACE: Interface = Interface {
        name: "test_node",
        version: 3,
        requests: &TEST_MESSAGES,
        events: &[],
    };

    #[test]
    fn message_metadata() {
        assert_eq!(TEST_MESSAGES[0].arg_count(), 1);
        assert_eq!(TEST_MESSAGES[0].since(), 1);
        assert_eq!(TEST_MESSAGES[0].fd_count(), 0);

        assert_eq!(TEST_MESSAGES[1].arg_count(), 3);
        assert_eq!(TEST_MESSAGES[1].since(), 3);
        assert_eq!(TEST_MESSAGES[1].fd_count(), 1);
    }

    #[test]
    fn interface_identity_by_name() {
        static CLONE: Interface = Interface {
            name: "test_node",
            version: 1,
            requests: &[],
            events: &[],
        };
        assert!(TEST_INTERFACE.same_as(&TEST_INTERFACE));
        assert!(TEST_INTERFACE.same_as(&CLONE));

        static OTHER: Interface = Interface {
            name: "other",
            version: 1,
            requests: &[],
            events: &[],
        };
        assert!(!TEST_INTERFACE.same_as(&OTHER));
    }
}
