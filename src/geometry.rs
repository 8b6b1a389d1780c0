//! CHS geometry derivation for the footer, per the VHD specification's
//! capacity-to-geometry algorithm.

/// Cylinder/head/sector geometry as stored in the footer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

/// The largest sector count CHS addressing can express.
pub const MAX_CHS_SECTORS: u64 = 65535 * 255 * 16;

impl Geometry {
    /// Derive geometry from a total sector count.
    pub fn of_sectors(total_sectors: u64) -> Self {
        let secs = total_sectors.min(MAX_CHS_SECTORS);

        let (sectors_per_track, heads, cylinders_times_heads) = if secs > 65535 * 63 * 16 {
            (255u64, 16u64, secs / 255)
        } else {
            let spt = 17u64;
            let cth = secs / spt;
            let heads = (cth.div_ceil(1024)).max(4);
            if cth >= heads * 1024 || heads > 16 {
                let spt = 31u64;
                let heads = 16u64;
                let cth = secs / spt;
                if cth >= heads * 1024 {
                    let spt = 63u64;
                    let cth = secs / spt;
                    (spt, heads, cth)
                } else {
                    (spt, heads, cth)
                }
            } else {
                (spt, heads, cth)
            }
        };

        Geometry {
            cylinders: (cylinders_times_heads / heads) as u16,
            heads: heads as u8,
            sectors: sectors_per_track as u8,
        }
    }

    /// The sector count this geometry addresses.
    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors as u64
    }
}
