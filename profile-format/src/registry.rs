use std::collections::HashMap;

use crate::codec;
use crate::types::BlockKind;
use crate::Result;

/// A call-site entry in the registry.
#[derive(Debug, Clone)]
pub struct RegisteredDescriptor {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub color: u32,
    pub kind: BlockKind,
    pub enabled: bool,
}

/// Process-wide descriptor table as an explicit service object.
///
/// Call sites register once and get back a dense numeric id; repeated
/// registration of the same `(name, file, line)` identity returns the
/// original id. Ids index into the table and are never reused.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: Vec<RegisteredDescriptor>,
    by_site: HashMap<(String, String, u32), u32>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        DescriptorRegistry::default()
    }

    /// Register a call site, memoized by `(name, file, line)`.
    pub fn register(
        &mut self,
        name: &str,
        file: &str,
        line: u32,
        color: u32,
        kind: BlockKind,
    ) -> u32 {
        let key = (name.to_string(), file.to_string(), line);
        if let Some(&id) = self.by_site.get(&key) {
            return id;
        }
        let id = self.descriptors.len() as u32;
        self.descriptors.push(RegisteredDescriptor {
            name: name.to_string(),
            file: file.to_string(),
            line,
            color,
            kind,
            enabled: true,
        });
        self.by_site.insert(key, id);
        id
    }

    pub fn descriptor(&self, id: u32) -> Option<&RegisteredDescriptor> {
        self.descriptors.get(id as usize)
    }

    /// Toggle one descriptor's enabled flag. Returns false for unknown ids.
    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> bool {
        match self.descriptors.get_mut(id as usize) {
            Some(d) => {
                d.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, id: u32) -> bool {
        self.descriptors
            .get(id as usize)
            .map(|d| d.enabled)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredDescriptor> {
        self.descriptors.iter()
    }

    /// Serialize the whole table in file framing, for flushing over the
    /// wire or into a container.
    pub fn serialize_table(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (id, d) in self.descriptors.iter().enumerate() {
            codec::push_descriptor_record(
                &mut out,
                id as u32,
                d.line,
                d.color,
                d.kind,
                d.enabled,
                &d.name,
                &d.file,
            )?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_register_is_memoized() {
        let mut registry = DescriptorRegistry::new();
        let a = registry.register("render", "render.rs", 10, 0xFF00FF00, BlockKind::Block);
        let b = registry.register("render", "render.rs", 10, 0xFF00FF00, BlockKind::Block);
        let c = registry.register("render", "render.rs", 11, 0xFF00FF00, BlockKind::Block);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[rstest]
    fn test_enable_toggle() {
        let mut registry = DescriptorRegistry::new();
        let id = registry.register("tick", "main.rs", 1, 0, BlockKind::Block);

        assert!(registry.is_enabled(id));
        assert!(registry.set_enabled(id, false));
        assert!(!registry.is_enabled(id));
        assert!(!registry.set_enabled(999, false));
        assert!(!registry.is_enabled(999));
    }

    #[rstest]
    fn test_serialize_table_round_trips_through_dump() {
        let mut registry = DescriptorRegistry::new();
        registry.register("update", "game.rs", 42, 0xFFAA0000, BlockKind::Block);
        registry.register("frame_event", "game.rs", 50, 0xFF0000AA, BlockKind::Event);
        registry.set_enabled(1, false);

        let bytes = registry.serialize_table().unwrap();
        let mut dump = crate::CaptureDump::new(crate::FileHeader::default());
        dump.extend_descriptors(&bytes).unwrap();

        assert_eq!(dump.descriptors.len(), 2);
        let d = dump.descriptor(1).unwrap();
        assert_eq!(dump.arena.str_view(d.name), "frame_event");
        assert_eq!(d.kind, BlockKind::Event);
        assert!(!d.enabled);
    }
}
