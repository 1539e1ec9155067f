//! Line locks: a fixed-capacity record of modified byte ranges.

/// A modified range of a page, counted in lines of `1 << line_shift` bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Line {
    pub offset: u16,
    pub len: u16,
}

impl Line {
    pub const fn new(offset: u16, len: u16) -> Self {
        Self { offset, len }
    }

    /// Returns the line index just past the range.
    pub const fn end(&self) -> u32 {
        self.offset as u32 + self.len as u32
    }
}

/// A fixed-capacity list of modified lines.
///
/// Lines that overlap or abut the most recent one are merged into it. Once
/// all `N` entries are taken, the lock collapses into a single line covering
/// everything recorded so far; this logs more bytes but never loses a change.
#[derive(Clone, Debug)]
pub struct LineLock<const N: usize> {
    lines: [Line; N],
    count: usize,
    line_shift: u8,
    collapsed: bool,
}

impl<const N: usize> LineLock<N> {
    /// Creates an empty line lock whose lines are `1 << line_shift` bytes.
    pub fn new(line_shift: u8) -> Self {
        Self {
            lines: [Line::default(); N],
            count: 0,
            line_shift,
            collapsed: false,
        }
    }

    /// Records `len` modified lines starting at line `offset`.
    pub fn add(&mut self, offset: u16, len: u16) {
        if len == 0 {
            return;
        }
        let new = Line::new(offset, len);

        if let Some(last) = self.lines[..self.count].last_mut() {
            if new.offset >= last.offset && new.offset as u32 <= last.end() {
                let end = last.end().max(new.end());
                last.len = clamp_len(end - last.offset as u32);
                return;
            }
        }

        if self.count == N {
            self.collapse_with(new);
            return;
        }
        self.lines[self.count] = new;
        self.count += 1;
    }

    /// Records a modified byte range, rounded out to whole lines.
    ///
    /// Line offsets and lengths are u16, so the range must end before line
    /// `u16::MAX`. With byte-sized lines that is the first 65535 bytes of
    /// the object.
    ///
    /// # Panics
    ///
    /// If the range reaches line `u16::MAX` or beyond.
    pub fn add_bytes(&mut self, byte_offset: usize, nbytes: usize) {
        if nbytes == 0 {
            return;
        }
        let first = byte_offset >> self.line_shift;
        let last = byte_offset.saturating_add(nbytes - 1) >> self.line_shift;
        assert!(
            last < u16::MAX as usize,
            "bytes {}+{} are past the last line",
            byte_offset,
            nbytes
        );
        self.add(first as u16, (last - first + 1) as u16);
    }

    fn collapse_with(&mut self, new: Line) {
        let lo = self.lines[..self.count]
            .iter()
            .map(|line| line.offset)
            .fold(new.offset, u16::min);
        let hi = self.lines[..self.count]
            .iter()
            .map(|line| line.end())
            .fold(new.end(), u32::max);
        self.lines[0] = Line::new(lo, clamp_len(hi - lo as u32));
        self.count = 1;
        self.collapsed = true;
    }

    /// Returns the recorded lines in insertion order.
    pub fn lines(&self) -> &[Line] {
        &self.lines[..self.count]
    }

    /// Returns the size of a line as a power of two.
    pub fn line_shift(&self) -> u8 {
        self.line_shift
    }

    /// Returns the smallest line covering every recorded line, bounded by
    /// the low and high watermarks of the lock.
    pub fn bounds(&self) -> Option<Line> {
        let lines = self.lines();
        let lo = lines.iter().map(|line| line.offset).min()?;
        let hi = lines.iter().map(|line| line.end()).max()?;
        Some(Line::new(lo, clamp_len(hi - lo as u32)))
    }

    /// Returns the total number of modified bytes.
    pub fn nbytes(&self) -> usize {
        self.lines()
            .iter()
            .map(|line| (line.len as usize) << self.line_shift)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns whether the lock ran out of entries and was collapsed.
    pub fn is_collapsed(&self) -> bool {
        self.collapsed
    }
}

fn clamp_len(len: u32) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}
