//! The VM's well-known names, interned once at startup as static strings.
//!
//! These are the member names the core itself looks up: the instance
//! constructor, the static constructor, the invocator, the indexer, the
//! iterator accessor, and the members consulted when reporting errors.

use super::{alloc_static_str, ManagedString};

pub struct StaticStrings {
    /// `.new` — the instance constructor.
    pub new_: *mut ManagedString,
    /// `.init` — the static constructor.
    pub init_: *mut ManagedString,
    /// `.call` — the default invocator member.
    pub call_: *mut ManagedString,
    /// `.item` — the indexer property.
    pub item_: *mut ManagedString,
    /// `.iter` — the iterator accessor.
    pub iter_: *mut ManagedString,
    /// `message` — consulted on errors escaping main.
    pub message: *mut ManagedString,
    /// `stackTrace` — receives the captured trace on throw.
    pub stack_trace: *mut ManagedString,
    /// `toString` — the stringification member.
    pub to_string: *mut ManagedString,
    /// The empty string.
    pub empty: *mut ManagedString,
}

impl StaticStrings {
    pub fn new() -> Self {
        Self {
            new_: alloc_static_str(".new"),
            init_: alloc_static_str(".init"),
            call_: alloc_static_str(".call"),
            item_: alloc_static_str(".item"),
            iter_: alloc_static_str(".iter"),
            message: alloc_static_str("message"),
            stack_trace: alloc_static_str("stackTrace"),
            to_string: alloc_static_str("toString"),
            empty: alloc_static_str(""),
        }
    }
}

impl Default for StaticStrings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::string_eq_str;

    #[test]
    fn test_well_known_names() {
        unsafe {
            let s = StaticStrings::new();
            assert!(string_eq_str(s.new_, ".new"));
            assert!(string_eq_str(s.init_, ".init"));
            assert!(string_eq_str(s.item_, ".item"));
            assert!((*s.empty).length == 0);
            assert!((*s.message).is_static());
        }
    }
}
