//! Kernel templates.
//!
//! A template is a pre-assembled machine-code fragment together with the
//! metadata needed to specialise a copy of it: where its 4-byte size/offset
//! fields live, which bytes flip between the forward and inverse direction,
//! and where its loop head sits so the copy can be placed with the loop head
//! on a fetch boundary. The generator treats every template the same way and
//! only decides which one to copy next.

use thiserror::Error;

use super::plan::Direction;

/// Number of offset fields every leaf pass carries.
pub const LEAF_PATCH_SITES: usize = 8;

/// Error types for template metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template {template}: expected {expected} patch values, got {actual}")]
    PatchCountMismatch {
        template: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Template {template}: site at {offset} exceeds length {len}")]
    SiteOutOfBounds {
        template: &'static str,
        offset: usize,
        len: usize,
    },

    #[error("Template {template}: sites at {first} and {second} overlap")]
    OverlappingSites {
        template: &'static str,
        first: usize,
        second: usize,
    },

    #[error("Template {template}: value {value:#x} does not fit the displacement at {offset}")]
    PatchOutOfRange {
        template: &'static str,
        offset: usize,
        value: u32,
    },

    #[error("Template {template}: {reason}")]
    Malformed {
        template: &'static str,
        reason: &'static str,
    },
}

/// Encoding of a patched field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Memory displacement, sign-extended by the CPU.
    Disp32,
    /// Immediate operand.
    Imm32,
}

impl PatchKind {
    /// Whether `value` keeps its meaning once written into a field of this
    /// kind.
    pub fn accepts(self, value: u32) -> bool {
        match self {
            PatchKind::Disp32 => i32::try_from(value).is_ok(),
            PatchKind::Imm32 => true,
        }
    }
}

/// A 4-byte little-endian field inside a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchSite {
    pub offset: usize,
    pub kind: PatchKind,
}

impl PatchSite {
    pub const WIDTH: usize = 4;

    pub const fn disp32(offset: usize) -> Self {
        Self {
            offset,
            kind: PatchKind::Disp32,
        }
    }

    pub const fn imm32(offset: usize) -> Self {
        Self {
            offset,
            kind: PatchKind::Imm32,
        }
    }

    fn end(&self) -> usize {
        self.offset + Self::WIDTH
    }
}

/// Pre-assembled fragment plus patch metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTemplate {
    name: &'static str,
    bytes: Vec<u8>,
    patch_sites: Vec<PatchSite>,
    sign_flips: Vec<usize>,
    flip_mask: u8,
    loop_entry: Option<usize>,
}

impl KernelTemplate {
    /// A template with no patch sites, flips or loop.
    pub fn new(name: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            name,
            bytes,
            patch_sites: Vec::new(),
            sign_flips: Vec::new(),
            flip_mask: 0,
            loop_entry: None,
        }
    }

    pub fn with_patch_sites(mut self, sites: Vec<PatchSite>) -> Self {
        self.patch_sites = sites;
        self
    }

    pub fn with_sign_flips(mut self, sites: Vec<usize>, mask: u8) -> Self {
        self.sign_flips = sites;
        self.flip_mask = mask;
        self
    }

    pub fn with_loop_entry(mut self, offset: usize) -> Self {
        self.loop_entry = Some(offset);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn patch_sites(&self) -> &[PatchSite] {
        &self.patch_sites
    }

    pub fn sign_flips(&self) -> &[usize] {
        &self.sign_flips
    }

    pub fn flip_mask(&self) -> u8 {
        self.flip_mask
    }

    /// Offset of the loop head, used as the alignment bias.
    pub fn loop_entry(&self) -> Option<usize> {
        self.loop_entry
    }

    /// Specialise a copy of this template for `direction`.
    ///
    /// Only bytes at the flip sites of `fragment` change; the template
    /// itself is never modified.
    pub fn apply_direction(&self, fragment: &mut [u8], direction: Direction) -> Result<(), TemplateError> {
        self.check_fragment(fragment)?;

        if direction.is_inverse() {
            for &site in &self.sign_flips {
                fragment[site] ^= self.flip_mask;
            }
        }

        Ok(())
    }

    /// Write `values[i]` into patch site `i` of `fragment`.
    ///
    /// Every value is checked against its site's kind before the first
    /// write, so a rejected call leaves `fragment` unchanged.
    pub fn apply_patches(&self, fragment: &mut [u8], values: &[u32]) -> Result<(), TemplateError> {
        self.check_fragment(fragment)?;

        if values.len() != self.patch_sites.len() {
            return Err(TemplateError::PatchCountMismatch {
                template: self.name,
                expected: self.patch_sites.len(),
                actual: values.len(),
            });
        }

        if let Some((site, &value)) = self
            .patch_sites
            .iter()
            .zip(values)
            .find(|(site, value)| !site.kind.accepts(**value))
        {
            return Err(TemplateError::PatchOutOfRange {
                template: self.name,
                offset: site.offset,
                value,
            });
        }

        for (site, value) in self.patch_sites.iter().zip(values) {
            fragment[site.offset..site.end()].copy_from_slice(&value.to_le_bytes());
        }

        Ok(())
    }

    /// Check that every site lies inside the fragment and that no two
    /// sites share a byte.
    pub fn validate(&self) -> Result<(), TemplateError> {
        let len = self.bytes.len();
        let out_of_bounds = |offset| TemplateError::SiteOutOfBounds {
            template: self.name,
            offset,
            len,
        };

        if self.is_empty() {
            return Err(TemplateError::Malformed {
                template: self.name,
                reason: "empty template",
            });
        }

        if !self.sign_flips.is_empty() && self.flip_mask == 0 {
            return Err(TemplateError::Malformed {
                template: self.name,
                reason: "sign flips with an empty mask",
            });
        }

        let mut ranges = Vec::with_capacity(self.patch_sites.len() + self.sign_flips.len());
        for site in &self.patch_sites {
            if site.end() > len {
                return Err(out_of_bounds(site.offset));
            }
            ranges.push((site.offset, site.end()));
        }
        for &site in &self.sign_flips {
            if site >= len {
                return Err(out_of_bounds(site));
            }
            ranges.push((site, site + 1));
        }
        if let Some(entry) = self.loop_entry {
            if entry >= len {
                return Err(out_of_bounds(entry));
            }
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(TemplateError::OverlappingSites {
                    template: self.name,
                    first: pair[0].0,
                    second: pair[1].0,
                });
            }
        }

        Ok(())
    }

    fn check_fragment(&self, fragment: &[u8]) -> Result<(), TemplateError> {
        if fragment.len() != self.bytes.len() {
            return Err(TemplateError::Malformed {
                template: self.name,
                reason: "fragment length differs from template",
            });
        }
        Ok(())
    }
}

/// Leaf pass variants, named by the parity of the input and output halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafVariant {
    EvenEven,
    OddOdd,
    EvenOdd,
    OddEven,
}

impl LeafVariant {
    pub const ALL: [LeafVariant; 4] = [
        LeafVariant::EvenEven,
        LeafVariant::OddOdd,
        LeafVariant::EvenOdd,
        LeafVariant::OddEven,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn short_name(self) -> &'static str {
        match self {
            LeafVariant::EvenEven => "ee",
            LeafVariant::OddOdd => "oo",
            LeafVariant::EvenOdd => "eo",
            LeafVariant::OddEven => "oe",
        }
    }
}

/// The two fixed-size subtransforms every call site targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseCase {
    X4,
    X8,
}

/// Every template the generator copies.
#[derive(Debug, Clone)]
pub struct KernelLibrary {
    pub x4: KernelTemplate,
    pub x8: KernelTemplate,
    pub leaf_init: KernelTemplate,
    /// Indexed by [`LeafVariant::index`].
    pub leaves: [KernelTemplate; 4],
    pub bridge: KernelTemplate,
}

impl KernelLibrary {
    pub fn leaf(&self, variant: LeafVariant) -> &KernelTemplate {
        &self.leaves[variant.index()]
    }

    pub fn base_case(&self, case: BaseCase) -> &KernelTemplate {
        match case {
            BaseCase::X4 => &self.x4,
            BaseCase::X8 => &self.x8,
        }
    }

    pub fn templates(&self) -> impl Iterator<Item = &KernelTemplate> {
        [&self.x4, &self.x8, &self.leaf_init, &self.bridge]
            .into_iter()
            .chain(self.leaves.iter())
    }

    pub fn max_template_len(&self) -> usize {
        self.templates().map(KernelTemplate::len).max().unwrap_or(0)
    }

    /// Validate every template; leaf passes must carry exactly
    /// [`LEAF_PATCH_SITES`] fields and nothing else may carry any.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for template in self.templates() {
            template.validate()?;
        }

        for variant in LeafVariant::ALL {
            let leaf = self.leaf(variant);
            if leaf.patch_sites().len() != LEAF_PATCH_SITES {
                return Err(TemplateError::PatchCountMismatch {
                    template: leaf.name(),
                    expected: LEAF_PATCH_SITES,
                    actual: leaf.patch_sites().len(),
                });
            }
        }

        for template in [&self.x4, &self.x8, &self.leaf_init, &self.bridge] {
            if !template.patch_sites().is_empty() {
                return Err(TemplateError::PatchCountMismatch {
                    template: template.name(),
                    expected: 0,
                    actual: template.patch_sites().len(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KernelTemplate {
        KernelTemplate::new("sample", vec![0x0F, 0x58, 0xC1, 0x00, 0x00, 0x00, 0x00, 0xC3])
            .with_patch_sites(vec![PatchSite::disp32(3)])
            .with_sign_flips(vec![1], 0x04)
            .with_loop_entry(0)
    }

    #[test]
    fn test_forward_leaves_bytes_untouched() {
        let template = sample();
        let mut fragment = template.bytes().to_vec();
        template.apply_direction(&mut fragment, Direction::Forward).unwrap();
        assert_eq!(fragment, template.bytes());
    }

    #[test]
    fn test_inverse_flips_only_marked_bytes() {
        let template = sample();
        let mut fragment = template.bytes().to_vec();
        template.apply_direction(&mut fragment, Direction::Inverse).unwrap();

        let changed: Vec<_> = (0..fragment.len())
            .filter(|&i| fragment[i] != template.bytes()[i])
            .collect();
        assert_eq!(changed, vec![1]);
        assert_eq!(fragment[1], 0x5C);
    }

    #[test]
    fn test_patches_are_little_endian() {
        let template = sample();
        let mut fragment = template.bytes().to_vec();
        template.apply_patches(&mut fragment, &[0x1234_5678]).unwrap();
        assert_eq!(&fragment[3..7], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_patch_count_mismatch() {
        let template = sample();
        let mut fragment = template.bytes().to_vec();
        let err = template.apply_patches(&mut fragment, &[1, 2]).unwrap_err();
        assert_eq!(
            err,
            TemplateError::PatchCountMismatch {
                template: "sample",
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn test_negative_displacement_rejected() {
        let template = sample();
        let mut fragment = template.bytes().to_vec();
        let err = template.apply_patches(&mut fragment, &[0x8000_0000]).unwrap_err();
        assert_eq!(
            err,
            TemplateError::PatchOutOfRange {
                template: "sample",
                offset: 3,
                value: 0x8000_0000
            }
        );
        assert_eq!(fragment, template.bytes());
    }

    #[test]
    fn test_immediate_takes_full_range() {
        let template = KernelTemplate::new("imm", vec![0xB9, 0, 0, 0, 0]).with_patch_sites(vec![PatchSite::imm32(1)]);
        let mut fragment = template.bytes().to_vec();
        template.apply_patches(&mut fragment, &[u32::MAX]).unwrap();
        assert_eq!(&fragment[1..], &[0xFF; 4]);
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let template = KernelTemplate::new("short", vec![0; 4]).with_patch_sites(vec![PatchSite::imm32(2)]);
        assert!(matches!(
            template.validate(),
            Err(TemplateError::SiteOutOfBounds { offset: 2, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let template = KernelTemplate::new("overlap", vec![0; 16])
            .with_patch_sites(vec![PatchSite::disp32(4)])
            .with_sign_flips(vec![6], 0x04);
        assert!(matches!(
            template.validate(),
            Err(TemplateError::OverlappingSites { first: 4, second: 6, .. })
        ));
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_wrong_fragment_length() {
        let template = sample();
        let mut fragment = vec![0; 3];
        assert!(matches!(
            template.apply_direction(&mut fragment, Direction::Inverse),
            Err(TemplateError::Malformed { .. })
        ));
    }
}
