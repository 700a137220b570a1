use std::collections::HashMap;

use super::Type;

/// Dense identifier of a binding site, used as a content-free handle across
/// passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub id: VarId,
    pub ty: Type,
}

/// Stack of lexical scopes mapping names to `(VarId, Type)`. The `VarId`
/// counter is monotonic for one compilation.
#[derive(Debug, Clone, Default)]
pub struct ScopeStack {
    frames: Vec<HashMap<String, ScopeEntry>>,
    next: u32,
}

impl ScopeStack {
    pub fn push(&mut self) {
        self.frames.push(HashMap::default());
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Declare a variable in the innermost scope, minting a fresh [`VarId`].
    pub fn declare(&mut self, name: &str, ty: Type) -> VarId {
        let id = VarId(self.next);
        self.next += 1;

        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_owned(), ScopeEntry { id, ty });
        }

        id
    }

    /// Find a variable by walking the scope stack from the inside out.
    pub fn lookup(&self, name: &str) -> Option<&ScopeEntry> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
    }

    pub fn contains_in_current_scope(&self, name: &str) -> bool {
        self.frames
            .last()
            .map(|frame| frame.contains_key(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_mints_dense_ids() {
        let mut scopes = ScopeStack::default();
        scopes.push();

        let a = scopes.declare("a", Type::Int32);
        let b = scopes.declare("b", Type::Float32);

        assert_eq!(a, VarId(0));
        assert_eq!(b, VarId(1));
    }

    #[test]
    fn test_lookup_walks_outward() {
        let mut scopes = ScopeStack::default();
        scopes.push();
        let outer = scopes.declare("x", Type::Int32);

        scopes.push();
        assert_eq!(scopes.lookup("x").map(|entry| entry.id), Some(outer));

        let inner = scopes.declare("x", Type::Float32);
        assert_eq!(scopes.lookup("x").map(|entry| entry.id), Some(inner));

        scopes.pop();
        assert_eq!(scopes.lookup("x").map(|entry| entry.id), Some(outer));
    }
}
