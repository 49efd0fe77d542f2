//! Deterministic visual fingerprint for a batch's public identifier.
//!
//! The artifact is a 25×25 matrix: three nested-square anchors in the
//! top-left, top-right and bottom-left corners, every other cell filled
//! from the bits of a 32-bit hash of the identifier. It resembles a
//! scannable code but does not implement any matrix-code standard.
//!
//! The identifier is the relational batch id, which exists as soon as the
//! batch row commits. The chain id is never used here because it may
//! never be assigned.

use std::fmt::Write as _;

use base64::Engine as _;

/// Modules per side.
pub const GRID_SIZE: usize = 25;

/// Anchor marker side length.
const ANCHOR_SIZE: usize = 7;

/// Rendered canvas size in pixels.
const CANVAS_PX: usize = 400;

/// A generated fingerprint matrix. Row-major, `true` = filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    cells: Vec<bool>,
}

/// 32-bit string hash: `h = h * 31 + unit` over UTF-16 code units with
/// two's-complement wrap, then absolute value.
pub fn identifier_hash(identifier: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in identifier.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    // i32::MIN has no positive counterpart; its bit pattern is kept.
    hash.wrapping_abs() as u32
}

/// Whether `(row, col)` is a filled module of one of the three anchors.
///
/// Each anchor is a 7×7 block whose outer border and 3×3 core are filled
/// and whose middle ring is empty.
pub fn is_anchor_cell(row: usize, col: usize) -> bool {
    let far = GRID_SIZE - ANCHOR_SIZE;
    let top_left = row < ANCHOR_SIZE && col < ANCHOR_SIZE;
    let top_right = row < ANCHOR_SIZE && col >= far;
    let bottom_left = row >= far && col < ANCHOR_SIZE;

    if !(top_left || top_right || bottom_left) {
        return false;
    }

    let local_row = if bottom_left { row - far } else { row };
    let local_col = if top_right { col - far } else { col };

    let outer = local_row == 0
        || local_row == ANCHOR_SIZE - 1
        || local_col == 0
        || local_col == ANCHOR_SIZE - 1;
    let core = (2..=4).contains(&local_row) && (2..=4).contains(&local_col);
    outer || core
}

impl Fingerprint {
    /// Generate the fingerprint for `identifier`.
    pub fn generate(identifier: &str) -> Self {
        let hash = identifier_hash(identifier);
        let mut cells = Vec::with_capacity(GRID_SIZE * GRID_SIZE);
        for row in 0..GRID_SIZE {
            for col in 0..GRID_SIZE {
                let bit = (row * GRID_SIZE + col) % 32;
                let from_hash = (hash >> bit) & 1 == 1;
                cells.push(from_hash || is_anchor_cell(row, col));
            }
        }
        Fingerprint { cells }
    }

    pub fn size(&self) -> usize {
        GRID_SIZE
    }

    pub fn is_filled(&self, row: usize, col: usize) -> bool {
        row < GRID_SIZE && col < GRID_SIZE && self.cells[row * GRID_SIZE + col]
    }

    /// Row-major matrix, one `Vec<bool>` per row.
    pub fn rows(&self) -> Vec<Vec<bool>> {
        self.cells
            .chunks(GRID_SIZE)
            .map(|row| row.to_vec())
            .collect()
    }

    pub fn filled_count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    /// Render as an SVG document: white 400px canvas, 16px modules drawn
    /// 15px wide so adjacent modules keep a hairline gap.
    pub fn to_svg(&self) -> String {
        let module = CANVAS_PX / GRID_SIZE;
        let mut svg = String::with_capacity(32 * self.cells.len());
        let _ = write!(
            svg,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{px}\" height=\"{px}\" \
             viewBox=\"0 0 {px} {px}\" shape-rendering=\"crispEdges\">\
             <rect width=\"{px}\" height=\"{px}\" fill=\"#FFFFFF\"/>",
            px = CANVAS_PX
        );
        for row in 0..GRID_SIZE {
            for col in 0..GRID_SIZE {
                if self.is_filled(row, col) {
                    let _ = write!(
                        svg,
                        "<rect x=\"{}\" y=\"{}\" width=\"{w}\" height=\"{w}\" fill=\"#000000\"/>",
                        col * module,
                        row * module,
                        w = module - 1
                    );
                }
            }
        }
        svg.push_str("</svg>");
        svg
    }

    /// The SVG rendering as a `data:` URL.
    pub fn to_data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.to_svg());
        format!("data:image/svg+xml;base64,{encoded}")
    }

    /// Two characters per module, for terminals.
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity((GRID_SIZE * 2 + 1) * GRID_SIZE);
        for row in self.cells.chunks(GRID_SIZE) {
            for filled in row {
                out.push_str(if *filled { "██" } else { "  " });
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(identifier_hash(""), 0);
        assert_eq!(identifier_hash("a"), 97);
        assert_eq!(identifier_hash("ab"), 97 * 31 + 98);
        assert_eq!(identifier_hash("hello world"), 1_794_106_052);
        // Wraps negative before the absolute value.
        assert_eq!(identifier_hash("batch-0001"), 316_323_148);
        // Hashes to i32::MIN.
        assert_eq!(identifier_hash("polygenelubricants"), 0x8000_0000);
    }

    #[test]
    fn same_identifier_same_artifact() {
        let a = Fingerprint::generate("3f2b6c1e-0d4a-4a55-9c1f-7d1f0f4b2a10");
        let b = Fingerprint::generate("3f2b6c1e-0d4a-4a55-9c1f-7d1f0f4b2a10");
        assert_eq!(a, b);
        assert_eq!(a.to_svg(), b.to_svg());
        assert_eq!(a.to_data_url(), b.to_data_url());
    }

    #[test]
    fn different_identifiers_differ() {
        let a = Fingerprint::generate("batch-0001");
        let b = Fingerprint::generate("batch-0002");
        assert_ne!(a, b);
    }

    #[test]
    fn anchors_present_regardless_of_hash() {
        let fp = Fingerprint::generate("");
        // Empty identifier hashes to zero, so only anchors are filled.
        let anchor_cells = (0..GRID_SIZE)
            .flat_map(|r| (0..GRID_SIZE).map(move |c| (r, c)))
            .filter(|(r, c)| is_anchor_cell(*r, *c))
            .count();
        assert_eq!(fp.filled_count(), anchor_cells);
        // 24 border + 9 core per anchor.
        assert_eq!(anchor_cells, 3 * 33);
    }

    #[test]
    fn anchor_shape() {
        // Top-left: border, ring gap, core.
        assert!(is_anchor_cell(0, 0));
        assert!(is_anchor_cell(6, 3));
        assert!(!is_anchor_cell(1, 1));
        assert!(is_anchor_cell(3, 3));
        // Top-right and bottom-left mirror the same pattern.
        assert!(is_anchor_cell(0, 24));
        assert!(!is_anchor_cell(1, 23));
        assert!(is_anchor_cell(21, 3));
        assert!(is_anchor_cell(24, 0));
        // No anchor bottom-right.
        assert!(!is_anchor_cell(24, 24));
        assert!(!is_anchor_cell(12, 12));
    }

    #[test]
    fn svg_shape() {
        let svg = Fingerprint::generate("").to_svg();
        assert!(svg.starts_with("<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"400\""));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("<rect x=\"0\" y=\"0\" width=\"15\" height=\"15\" fill=\"#000000\"/>"));
        assert_eq!(svg.matches("fill=\"#000000\"").count(), 99);
    }

    #[test]
    fn data_url_prefix() {
        let url = Fingerprint::generate("x").to_data_url();
        assert!(url.starts_with("data:image/svg+xml;base64,PHN2Zy"));
    }

    #[test]
    fn text_rendering_dimensions() {
        let text = Fingerprint::generate("lot").to_text();
        assert_eq!(text.lines().count(), GRID_SIZE);
        assert!(text.lines().all(|l| l.chars().count() == GRID_SIZE * 2));
    }
}
