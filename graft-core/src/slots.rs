//! The fixed set of pipeline slots that can hold a compilable submodule.
//!
//! Diffusion pipelines differ in which submodules they carry, but the set of
//! submodules worth compiling is small and closed. Each variant names one
//! such submodule; its dotted path doubles as the on-disk artifact name.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    TextEncoder,
    TextEncoder2,
    ImageEncoder,
    UNet,
    ControlNet,
    FastUNet,
    VaeDecoder,
    VaeEncoder,
}

impl Slot {
    /// Every slot, in compilation order.
    pub const ALL: [Slot; 8] = [
        Slot::TextEncoder,
        Slot::TextEncoder2,
        Slot::ImageEncoder,
        Slot::UNet,
        Slot::ControlNet,
        Slot::FastUNet,
        Slot::VaeDecoder,
        Slot::VaeEncoder,
    ];

    /// Dotted path of the slot inside a pipeline.
    pub fn path(&self) -> &'static str {
        match self {
            Slot::TextEncoder => "text_encoder",
            Slot::TextEncoder2 => "text_encoder_2",
            Slot::ImageEncoder => "image_encoder",
            Slot::UNet => "unet",
            Slot::ControlNet => "controlnet",
            Slot::FastUNet => "fast_unet",
            Slot::VaeDecoder => "vae.decoder",
            Slot::VaeEncoder => "vae.encoder",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Selects the slots that survive an ignore set, preserving compilation order.
///
/// An ignore entry excludes a slot when it equals the slot's path or names a
/// dotted ancestor of it, so `"vae"` excludes both `vae.decoder` and
/// `vae.encoder` while leaving `fast_unet` alone.
pub fn select_parts(ignores: &[&str]) -> Vec<Slot> {
    Slot::ALL
        .iter()
        .copied()
        .filter(|slot| !ignores.iter().any(|ignore| covers(ignore, slot.path())))
        .collect()
}

fn covers(ignore: &str, path: &str) -> bool {
    path == ignore
        || path
            .strip_prefix(ignore)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ignores_selects_all_slots_in_order() {
        assert_eq!(select_parts(&[]), Slot::ALL.to_vec());
    }

    #[test]
    fn test_exact_ignore_excludes_single_slot() {
        let parts = select_parts(&["unet"]);
        assert!(!parts.contains(&Slot::UNet));
        // `unet` is not a dotted ancestor of `fast_unet`.
        assert!(parts.contains(&Slot::FastUNet));
        assert_eq!(parts.len(), 7);
    }

    #[test]
    fn test_ancestor_ignore_excludes_descendants() {
        let parts = select_parts(&["vae"]);
        assert!(!parts.contains(&Slot::VaeDecoder));
        assert!(!parts.contains(&Slot::VaeEncoder));
        assert_eq!(parts.len(), 6);
    }

    #[test]
    fn test_exact_dotted_ignore_keeps_sibling() {
        let parts = select_parts(&["vae.decoder"]);
        assert!(!parts.contains(&Slot::VaeDecoder));
        assert!(parts.contains(&Slot::VaeEncoder));
    }

    #[test]
    fn test_plain_prefix_is_not_an_ancestor() {
        // "text" is a string prefix of two slots but not a dotted ancestor.
        let parts = select_parts(&["text"]);
        assert_eq!(parts, Slot::ALL.to_vec());
    }

    #[test]
    fn test_selection_preserves_relative_order() {
        let parts = select_parts(&["text_encoder_2", "controlnet"]);
        let expected = vec![
            Slot::TextEncoder,
            Slot::ImageEncoder,
            Slot::UNet,
            Slot::FastUNet,
            Slot::VaeDecoder,
            Slot::VaeEncoder,
        ];
        assert_eq!(parts, expected);
    }

    #[test]
    fn test_unknown_ignore_entries_are_harmless() {
        let parts = select_parts(&["scheduler", "tokenizer"]);
        assert_eq!(parts.len(), 8);
    }
}
