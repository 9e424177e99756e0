//! Address translation for a single contiguous DMA allocation.

use std::ops::Range;

/// The CPU and device view of one DMA allocation.
///
/// Both views are contiguous and of the same length, so translating between
/// them is a constant offset. Addresses outside the allocation have no
/// translation; asking for one is a caller bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaWindow {
    virt_base: usize,
    phys_base: u64,
    len: usize,
}

impl DmaWindow {
    /// Describe an allocation mapped at `virt_base` for the CPU and at
    /// `phys_base` for the device.
    ///
    /// Neither range may wrap around the end of its address space.
    pub const fn new(virt_base: usize, phys_base: u64, len: usize) -> Self {
        assert!(
            virt_base.checked_add(len).is_some() && phys_base.checked_add(len as u64).is_some(),
            "DMA window wraps around the address space"
        );

        Self {
            virt_base,
            phys_base,
            len,
        }
    }

    /// The CPU address of the first byte.
    pub const fn virt_base(&self) -> usize {
        self.virt_base
    }

    /// The device address of the first byte.
    pub const fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// The length of the allocation in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the window covers no bytes.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The device addresses covered by the allocation.
    pub const fn phys_range(&self) -> Range<u64> {
        self.phys_base..self.phys_base + self.len as u64
    }

    /// The CPU addresses covered by the allocation.
    pub const fn virt_range(&self) -> Range<usize> {
        self.virt_base..self.virt_base + self.len
    }

    /// Returns true if `phys` lies inside the allocation.
    pub fn contains_phys(&self, phys: u64) -> bool {
        self.phys_range().contains(&phys)
    }

    /// Returns true if `virt` lies inside the allocation.
    pub fn contains_virt(&self, virt: usize) -> bool {
        self.virt_range().contains(&virt)
    }

    /// Translate a device address into the CPU address of the same byte.
    pub fn phys_to_virt(&self, phys: u64) -> usize {
        assert!(
            self.contains_phys(phys),
            "physical address {phys:#x} is outside of DMA window {:#x?}",
            self.phys_range()
        );

        // Cannot truncate, the offset is smaller than self.len.
        self.virt_base + (phys - self.phys_base) as usize
    }

    /// Translate a CPU address into the device address of the same byte.
    pub fn virt_to_phys(&self, virt: usize) -> u64 {
        assert!(
            self.contains_virt(virt),
            "virtual address {virt:#x} is outside of DMA window {:#x?}",
            self.virt_range()
        );

        self.phys_base + (virt - self.virt_base) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: DmaWindow = DmaWindow::new(0x7f00_0000_1000, 0x8000_0000, 0x2000);

    #[test]
    fn translates_both_ends() {
        assert_eq!(WINDOW.phys_to_virt(0x8000_0000), 0x7f00_0000_1000);
        assert_eq!(WINDOW.phys_to_virt(0x8000_1fff), 0x7f00_0000_2fff);
        assert_eq!(WINDOW.virt_to_phys(0x7f00_0000_1010), 0x8000_0010);
    }

    #[test]
    fn physical_base_below_virtual_base() {
        let window = DmaWindow::new(0x1000, 0x10_0000, 0x1000);

        assert_eq!(window.phys_to_virt(0x10_0040), 0x1040);
        assert_eq!(window.virt_to_phys(0x1040), 0x10_0040);
    }

    #[test]
    #[should_panic(expected = "outside of DMA window")]
    fn rejects_address_past_the_end() {
        WINDOW.phys_to_virt(0x8000_2000);
    }

    #[test]
    #[should_panic(expected = "outside of DMA window")]
    fn rejects_address_before_the_start() {
        WINDOW.virt_to_phys(0x7f00_0000_0fff);
    }

    #[test]
    fn window_may_end_at_the_top_of_the_address_space() {
        let window = DmaWindow::new(0x1000, u64::MAX - 0x1000, 0x1000);

        assert_eq!(window.phys_range().end, u64::MAX);
        assert_eq!(window.phys_to_virt(u64::MAX - 1), 0x1fff);
    }

    #[test]
    #[should_panic(expected = "wraps around the address space")]
    fn rejects_windows_that_wrap() {
        DmaWindow::new(0x1000, 0xffff_ffff_ffff_f000, 0x1000);
    }

    proptest! {
        #[test]
        fn translation_is_a_constant_offset(offset in 0..0x2000_u64) {
            let phys = WINDOW.phys_base() + offset;
            let virt = WINDOW.phys_to_virt(phys);

            prop_assert_eq!(virt - WINDOW.virt_base(), offset as usize);
            prop_assert_eq!(WINDOW.virt_to_phys(virt), phys);
        }
    }
}
