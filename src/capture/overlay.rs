/*!
 * Frame Overlays
 *
 * Software drawing on BGRA frame buffers: the synthetic cursor marker and
 * the click indicator ring drawn over captured display frames.
 */

/// Opaque white
pub const WHITE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Click ring colour (amber, BGRA)
pub const CLICK_RING: [u8; 4] = [0x00, 0xBF, 0xFF, 0xFF];

pub const CLICK_RING_RADIUS: u32 = 14;
pub const CLICK_RING_THICKNESS: u32 = 3;

/// Mutable view of one BGRA frame; every draw is clipped to the frame
pub struct FrameCanvas<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    stride: usize,
}

impl<'a> FrameCanvas<'a> {
    /// `None` if `data` is too short for `stride * height`
    pub fn new(data: &'a mut [u8], width: u32, height: u32, stride: usize) -> Option<Self> {
        if stride < width as usize * 4 || data.len() < stride * height as usize {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            stride,
        })
    }

    fn put(&mut self, x: i64, y: i64, bgra: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let at = y as usize * self.stride + x as usize * 4;
        self.data[at..at + 4].copy_from_slice(&bgra);
    }

    /// Fill the `size`×`size` square whose top-left corner is `(x, y)`
    pub fn fill_square(&mut self, x: i64, y: i64, size: u32, bgra: [u8; 4]) {
        for dy in 0..size as i64 {
            for dx in 0..size as i64 {
                self.put(x + dx, y + dy, bgra);
            }
        }
    }

    /// Draw a ring centred on `(cx, cy)`, `thickness` pixels wide inward
    /// from `radius`
    pub fn ring(&mut self, cx: i64, cy: i64, radius: u32, thickness: u32, bgra: [u8; 4]) {
        let outer = radius as i64;
        let inner = outer - thickness as i64;
        let (outer_sq, inner_sq) = (outer * outer, inner.max(0) * inner.max(0));

        for dy in -outer..=outer {
            for dx in -outer..=outer {
                let d = dx * dx + dy * dy;
                if d <= outer_sq && d >= inner_sq {
                    self.put(cx + dx, cy + dy, bgra);
                }
            }
        }
    }
}

/// Map a point in global display coordinates onto a scaled frame
///
/// `origin`/`size` are the display bounds in points. Returns `None` when the
/// point lies outside the display.
pub fn display_to_frame(
    point: (f64, f64),
    origin: (f64, f64),
    size: (f64, f64),
    frame: (u32, u32),
) -> Option<(i64, i64)> {
    if size.0 <= 0.0 || size.1 <= 0.0 {
        return None;
    }
    let rel_x = (point.0 - origin.0) / size.0;
    let rel_y = (point.1 - origin.1) / size.1;
    if !(0.0..1.0).contains(&rel_x) || !(0.0..1.0).contains(&rel_y) {
        return None;
    }
    Some((
        (rel_x * frame.0 as f64) as i64,
        (rel_y * frame.1 as f64) as i64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(data: &[u8], stride: usize, x: usize, y: usize) -> &[u8] {
        &data[y * stride + x * 4..y * stride + x * 4 + 4]
    }

    #[test]
    fn test_canvas_rejects_short_buffer() {
        let mut data = vec![0u8; 10];
        assert!(FrameCanvas::new(&mut data, 4, 4, 16).is_none());
        let mut data = vec![0u8; 64];
        assert!(FrameCanvas::new(&mut data, 4, 4, 8).is_none());
    }

    #[test]
    fn test_square_clips_at_edges() {
        let mut data = vec![0u8; 8 * 8 * 4];
        let mut canvas = FrameCanvas::new(&mut data, 8, 8, 32).unwrap();
        canvas.fill_square(6, -2, 4, WHITE);

        assert_eq!(pixel(&data, 32, 7, 0), &WHITE);
        assert_eq!(pixel(&data, 32, 6, 1), &WHITE);
        assert_eq!(pixel(&data, 32, 5, 0), &[0, 0, 0, 0]);
        assert_eq!(pixel(&data, 32, 7, 2), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_ring_leaves_centre_untouched() {
        let mut data = vec![0u8; 40 * 40 * 4];
        let mut canvas = FrameCanvas::new(&mut data, 40, 40, 160).unwrap();
        canvas.ring(20, 20, CLICK_RING_RADIUS, CLICK_RING_THICKNESS, CLICK_RING);

        assert_eq!(pixel(&data, 160, 20, 20), &[0, 0, 0, 0]);
        assert_eq!(pixel(&data, 160, 20 + CLICK_RING_RADIUS as usize, 20), &CLICK_RING);
        assert_eq!(pixel(&data, 160, 20, 20 - CLICK_RING_RADIUS as usize + 1), &CLICK_RING);
        assert_eq!(pixel(&data, 160, 20 + CLICK_RING_RADIUS as usize + 1, 20), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_display_to_frame_scales() {
        // 1440x900 point display captured at 720x450.
        let mapped = display_to_frame((720.0, 450.0), (0.0, 0.0), (1440.0, 900.0), (720, 450));
        assert_eq!(mapped, Some((360, 225)));

        // Secondary-origin display offsets are removed.
        let mapped = display_to_frame((-100.0, 10.0), (-200.0, 0.0), (200.0, 100.0), (400, 200));
        assert_eq!(mapped, Some((200, 20)));

        assert_eq!(display_to_frame((1500.0, 10.0), (0.0, 0.0), (1440.0, 900.0), (720, 450)), None);
        assert_eq!(display_to_frame((1.0, 1.0), (0.0, 0.0), (0.0, 900.0), (720, 450)), None);
    }
}
