//! # Atom Registry
//!
//! BATs are typed by *atoms*: element descriptors keyed by a small integer.
//! The pool itself only needs a narrow slice of the atom machinery: name
//! lookup when parsing the directory file, element width validation, the
//! varsized flag, and an optional per-element `unfix` hook invoked when a
//! BAT carrying resource-owning elements is destroyed.
//!
//! ## Unknown atoms
//!
//! A directory written by a server with extension atoms may name a type this
//! build does not know. Such names are retained *symbolically* with a
//! negative id, are written back verbatim on commit, and are re-resolved
//! against the registry whenever a quick descriptor is requested. This way a
//! later upgraded server sees the type again, and nothing is lost in
//! between.

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Atom index. Non-negative values index the registry; negative values are
/// placeholders for symbolically retained unknown type names.
pub type AtomId = i32;

pub const TYPE_VOID: AtomId = 0;
pub const TYPE_INT: AtomId = 4;
pub const TYPE_OID: AtomId = 6;
pub const TYPE_LNG: AtomId = 7;
pub const TYPE_STR: AtomId = 9;

/// Per-element destructor for atoms whose values own external resources.
pub type AtomUnfix = fn(&[u8]);

#[derive(Clone)]
pub struct AtomDef {
    pub name: &'static str,
    pub size: u16,
    pub varsized: bool,
    pub unfix: Option<AtomUnfix>,
}

pub struct AtomRegistry {
    atoms: RwLock<Vec<AtomDef>>,
    by_name: RwLock<HashMap<&'static str, AtomId>>,
    unknown: RwLock<Vec<String>>,
}

impl Default for AtomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomRegistry {
    pub fn new() -> Self {
        let builtin = vec![
            AtomDef { name: "void", size: 0, varsized: true, unfix: None },
            AtomDef { name: "bit", size: 1, varsized: false, unfix: None },
            AtomDef { name: "bte", size: 1, varsized: false, unfix: None },
            AtomDef { name: "sht", size: 2, varsized: false, unfix: None },
            AtomDef { name: "int", size: 4, varsized: false, unfix: None },
            AtomDef { name: "flt", size: 4, varsized: false, unfix: None },
            AtomDef { name: "oid", size: 8, varsized: false, unfix: None },
            AtomDef { name: "lng", size: 8, varsized: false, unfix: None },
            AtomDef { name: "dbl", size: 8, varsized: false, unfix: None },
            AtomDef { name: "str", size: 8, varsized: true, unfix: None },
        ];
        debug_assert_eq!(builtin[TYPE_STR as usize].name, "str");
        let by_name = builtin
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name, i as AtomId))
            .collect();
        Self {
            atoms: RwLock::new(builtin),
            by_name: RwLock::new(by_name),
            unknown: RwLock::new(Vec::new()),
        }
    }

    /// Registers an additional atom and returns its id.
    pub fn register(&self, def: AtomDef) -> AtomId {
        let mut atoms = self.atoms.write();
        let id = atoms.len() as AtomId;
        self.by_name.write().insert(def.name, id);
        atoms.push(def);
        id
    }

    /// Looks up an atom by name.
    pub fn index(&self, name: &str) -> Option<AtomId> {
        self.by_name.read().get(name).copied()
    }

    /// Retains an unknown type name and returns its negative placeholder id.
    /// Returns the existing placeholder when the name was seen before.
    pub fn unknown_find(&self, name: &str) -> AtomId {
        let mut unknown = self.unknown.write();
        if let Some(i) = unknown.iter().position(|n| n == name) {
            return -((i + 1) as AtomId);
        }
        unknown.push(name.to_string());
        -(unknown.len() as AtomId)
    }

    /// Name behind a negative placeholder id.
    pub fn unknown_name(&self, id: AtomId) -> Option<String> {
        debug_assert!(id < 0);
        self.unknown.read().get((-id - 1) as usize).cloned()
    }

    pub fn name(&self, id: AtomId) -> Option<String> {
        if id < 0 {
            self.unknown_name(id)
        } else {
            self.atoms.read().get(id as usize).map(|a| a.name.to_string())
        }
    }

    pub fn size(&self, id: AtomId) -> Option<u16> {
        self.atoms.read().get(id.max(0) as usize).map(|a| a.size)
    }

    pub fn varsized(&self, id: AtomId) -> Option<bool> {
        self.atoms.read().get(id.max(0) as usize).map(|a| a.varsized)
    }

    pub fn unfix(&self, id: AtomId) -> Option<AtomUnfix> {
        if id < 0 {
            return None;
        }
        self.atoms.read().get(id as usize).and_then(|a| a.unfix)
    }
}

/// Shift corresponding to a fixed element width, for byte <-> row
/// conversions.
pub fn elmshift(width: u16) -> u8 {
    debug_assert!(width == 0 || width.is_power_of_two());
    if width <= 1 {
        0
    } else {
        width.trailing_zeros() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup() {
        let reg = AtomRegistry::new();
        assert_eq!(reg.index("int"), Some(4));
        assert_eq!(reg.index("str"), Some(TYPE_STR));
        assert_eq!(reg.index("nosuch"), None);
        assert_eq!(reg.size(4), Some(4));
        assert!(reg.varsized(TYPE_STR).unwrap());
        assert!(reg.varsized(TYPE_VOID).unwrap());
    }

    #[test]
    fn unknown_atoms_are_retained_symbolically() {
        let reg = AtomRegistry::new();
        let id = reg.unknown_find("uuid");
        assert!(id < 0);
        assert_eq!(reg.unknown_find("uuid"), id);
        assert_eq!(reg.unknown_name(id).as_deref(), Some("uuid"));
        assert_eq!(reg.name(id).as_deref(), Some("uuid"));

        let other = reg.unknown_find("inet");
        assert_ne!(other, id);
    }

    #[test]
    fn elmshift_widths() {
        assert_eq!(elmshift(0), 0);
        assert_eq!(elmshift(1), 0);
        assert_eq!(elmshift(2), 1);
        assert_eq!(elmshift(4), 2);
        assert_eq!(elmshift(8), 3);
    }
}
