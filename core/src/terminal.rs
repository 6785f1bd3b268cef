//! Terminal Model (§4.3): an in-memory VT screen maintained per session, fed the same
//! byte stream the Recorder receives. Built on `vte`'s parser (the same one Alacritty
//! uses) driving our own cell grid; `vte` only tokenizes escape sequences, all terminal
//! *semantics* (cursor motion, SGR, scrolling, alt screen) live here.

use std::collections::VecDeque;

use unicode_width::UnicodeWidthChar;
use vte::{Params, Parser, Perform};

const SNAPSHOT_MAGIC: [u8; 2] = [b'V', b'T'];
const SNAPSHOT_VERSION: u8 = 1;
const ROW_MARKER_CONTENT: u8 = 0xFD;
const ROW_MARKER_EMPTY: u8 = 0xFE;

/// A terminal color. `Default` means "whatever the renderer's default fg/bg is".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// Style bits that fit the snapshot wire format's one-byte-per-cell `attr` field.
const ATTR_BOLD: u8 = 0x01;
const ATTR_ITALIC: u8 = 0x02;
const ATTR_UNDERLINE: u8 = 0x04;
const ATTR_INVERSE: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pen {
    bold: bool,
    italic: bool,
    underline: bool,
    inverse: bool,
    fg: Color,
    bg: Color,
}

impl Default for Pen {
    fn default() -> Self {
        Self { bold: false, italic: false, underline: false, inverse: false, fg: Color::Default, bg: Color::Default }
    }
}

impl Pen {
    fn attr_byte(&self) -> u8 {
        let mut b = 0;
        if self.bold {
            b |= ATTR_BOLD;
        }
        if self.italic {
            b |= ATTR_ITALIC;
        }
        if self.underline {
            b |= ATTR_UNDERLINE;
        }
        if self.inverse {
            b |= ATTR_INVERSE;
        }
        b
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cell {
    ch: char,
    /// Display width of `ch` (0 for a wide character's continuation cell).
    width: u8,
    pen: Pen,
}

impl Default for Cell {
    fn default() -> Self {
        Self { ch: ' ', width: 1, pen: Pen::default() }
    }
}

type Row = Vec<Cell>;

fn blank_row(cols: usize) -> Row {
    vec![Cell::default(); cols]
}

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    x: usize,
    y: usize,
}

/// One of the two screen buffers. The alternate buffer never grows scrollback.
struct Buffer {
    rows: VecDeque<Row>,
    scrollback: VecDeque<Row>,
    scrollback_cap: usize,
}

impl Buffer {
    fn new(cols: usize, rows: usize, scrollback_cap: usize) -> Self {
        Self {
            rows: (0..rows).map(|_| blank_row(cols)).collect(),
            scrollback: VecDeque::new(),
            scrollback_cap,
        }
    }
}

/// Grid state plus cursor/mode tracking. Implements [`vte::Perform`] directly so the
/// parser can drive it with no intermediate event allocation.
struct GridState {
    cols: usize,
    rows: usize,
    primary: Buffer,
    alt: Buffer,
    alt_active: bool,
    cursor: Cursor,
    saved_cursor: Option<Cursor>,
    pen: Pen,
    scroll_top: usize,
    scroll_bottom: usize,
    auto_wrap: bool,
    pending_wrap: bool,
    cursor_visible: bool,
    scrollback_cap: usize,
}

impl GridState {
    fn new(cols: u16, rows: u16, scrollback_cap: usize) -> Self {
        let cols = cols.max(1) as usize;
        let rows = rows.max(1) as usize;
        Self {
            cols,
            rows,
            primary: Buffer::new(cols, rows, scrollback_cap),
            alt: Buffer::new(cols, rows, 0),
            alt_active: false,
            cursor: Cursor::default(),
            saved_cursor: None,
            pen: Pen::default(),
            scroll_top: 0,
            scroll_bottom: rows.saturating_sub(1),
            auto_wrap: true,
            pending_wrap: false,
            cursor_visible: true,
            scrollback_cap,
        }
    }

    fn active(&mut self) -> &mut Buffer {
        if self.alt_active {
            &mut self.alt
        } else {
            &mut self.primary
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1) as usize;
        let rows = rows.max(1) as usize;
        for buf in [&mut self.primary, &mut self.alt] {
            for row in buf.rows.iter_mut() {
                row.resize(cols, Cell::default());
            }
            while buf.rows.len() < rows {
                buf.rows.push_back(blank_row(cols));
            }
            while buf.rows.len() > rows {
                buf.rows.pop_back();
            }
        }
        self.cols = cols;
        self.rows = rows;
        self.scroll_top = 0;
        self.scroll_bottom = rows.saturating_sub(1);
        self.cursor.x = self.cursor.x.min(cols.saturating_sub(1));
        self.cursor.y = self.cursor.y.min(rows.saturating_sub(1));
    }

    fn put_cell(&mut self, x: usize, y: usize, cell: Cell) {
        let scrollback_cap = self.scrollback_cap;
        let buf = self.active();
        if let Some(row) = buf.rows.get_mut(y) {
            if x < row.len() {
                row[x] = cell;
            }
        }
        let _ = scrollback_cap;
    }

    fn line_feed(&mut self) {
        let (top, bottom) = (self.scroll_top, self.scroll_bottom);
        if self.cursor.y == bottom {
            self.scroll_up(1);
        } else {
            self.cursor.y = (self.cursor.y + 1).min(self.rows.saturating_sub(1));
        }
        let _ = top;
    }

    fn reverse_index(&mut self) {
        if self.cursor.y == self.scroll_top {
            self.scroll_down(1);
        } else {
            self.cursor.y = self.cursor.y.saturating_sub(1);
        }
    }

    /// Scrolls the active scroll region up by `n`, pushing rows scrolled off the *whole
    /// screen's* top (only when the region's top is row 0) into scrollback.
    fn scroll_up(&mut self, n: usize) {
        let (top, bottom, cols, alt_active, cap) =
            (self.scroll_top, self.scroll_bottom, self.cols, self.alt_active, self.scrollback_cap);
        let buf = self.active();
        for _ in 0..n {
            if top < buf.rows.len() && bottom < buf.rows.len() && top <= bottom {
                let removed = buf.rows.remove(top);
                if let Some(removed) = removed {
                    if top == 0 && !alt_active {
                        buf.scrollback.push_back(removed);
                        while buf.scrollback.len() > cap {
                            buf.scrollback.pop_front();
                        }
                    }
                }
                buf.rows.insert(bottom.min(buf.rows.len()), blank_row(cols));
            }
        }
    }

    fn scroll_down(&mut self, n: usize) {
        let (top, bottom, cols) = (self.scroll_top, self.scroll_bottom, self.cols);
        let buf = self.active();
        for _ in 0..n {
            if bottom < buf.rows.len() && top <= bottom {
                buf.rows.remove(bottom);
                buf.rows.insert(top, blank_row(cols));
            }
        }
    }

    fn erase_screen(&mut self, mode: u16) {
        let (cols, rows) = (self.cols, self.rows);
        let (cx, cy) = (self.cursor.x, self.cursor.y);
        let buf = self.active();
        match mode {
            0 => {
                for x in cx..cols {
                    if let Some(c) = buf.rows[cy].get_mut(x) {
                        *c = Cell::default();
                    }
                }
                for y in (cy + 1)..rows {
                    buf.rows[y] = blank_row(cols);
                }
            }
            1 => {
                for y in 0..cy {
                    buf.rows[y] = blank_row(cols);
                }
                for x in 0..=cx.min(cols.saturating_sub(1)) {
                    if let Some(c) = buf.rows[cy].get_mut(x) {
                        *c = Cell::default();
                    }
                }
            }
            _ => {
                for y in 0..rows {
                    buf.rows[y] = blank_row(cols);
                }
            }
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let cols = self.cols;
        let (cx, cy) = (self.cursor.x, self.cursor.y);
        let buf = self.active();
        let Some(row) = buf.rows.get_mut(cy) else { return };
        match mode {
            0 => {
                for x in cx..cols {
                    row[x] = Cell::default();
                }
            }
            1 => {
                for x in 0..=cx.min(cols.saturating_sub(1)) {
                    row[x] = Cell::default();
                }
            }
            _ => {
                for x in 0..cols {
                    row[x] = Cell::default();
                }
            }
        }
    }

    fn reset(&mut self) {
        let (cols, rows, cap) = (self.cols, self.rows, self.scrollback_cap);
        self.primary = Buffer::new(cols, rows, cap);
        self.alt = Buffer::new(cols, rows, 0);
        self.alt_active = false;
        self.cursor = Cursor::default();
        self.saved_cursor = None;
        self.pen = Pen::default();
        self.scroll_top = 0;
        self.scroll_bottom = rows.saturating_sub(1);
        self.auto_wrap = true;
        self.pending_wrap = false;
        self.cursor_visible = true;
    }

    fn set_alt_screen(&mut self, enabled: bool, save_cursor: bool) {
        if enabled == self.alt_active {
            return;
        }
        if enabled {
            if save_cursor {
                self.saved_cursor = Some(self.cursor);
            }
            self.alt_active = true;
            let (cols, rows) = (self.cols, self.rows);
            self.alt = Buffer::new(cols, rows, 0);
            self.cursor = Cursor::default();
        } else {
            self.alt_active = false;
            if let Some(c) = self.saved_cursor.take() {
                self.cursor = c;
            }
        }
    }
}

impl Perform for GridState {
    fn print(&mut self, c: char) {
        if self.pending_wrap {
            self.line_feed();
            self.cursor.x = 0;
            self.pending_wrap = false;
        }
        let width = UnicodeWidthChar::width(c).unwrap_or(1) as u8;
        if width == 0 {
            return;
        }
        let (x, y, pen) = (self.cursor.x, self.cursor.y, self.pen);
        self.put_cell(x, y, Cell { ch: c, width, pen });
        if width == 2 && x + 1 < self.cols {
            self.put_cell(x + 1, y, Cell { ch: ' ', width: 0, pen });
        }
        self.cursor.x += width as usize;
        if self.cursor.x >= self.cols {
            self.cursor.x = self.cols.saturating_sub(1);
            if self.auto_wrap {
                self.pending_wrap = true;
            }
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x0A | 0x0B | 0x0C => self.line_feed(),
            0x0D => {
                self.cursor.x = 0;
                self.pending_wrap = false;
            }
            0x08 => {
                self.cursor.x = self.cursor.x.saturating_sub(1);
                self.pending_wrap = false;
            }
            0x09 => {
                let next = ((self.cursor.x / 8) + 1) * 8;
                self.cursor.x = next.min(self.cols.saturating_sub(1));
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let private = intermediates.first() == Some(&b'?');
        let codes: Vec<u16> = params.iter().map(|p| p.first().copied().unwrap_or(0)).collect();
        let arg = |i: usize, default: u16| -> u16 {
            codes.get(i).copied().filter(|&v| v != 0).unwrap_or(default)
        };
        let n = arg(0, 1) as usize;

        match action {
            'A' => self.cursor.y = self.cursor.y.saturating_sub(n),
            'B' => self.cursor.y = (self.cursor.y + n).min(self.rows.saturating_sub(1)),
            'C' => self.cursor.x = (self.cursor.x + n).min(self.cols.saturating_sub(1)),
            'D' => self.cursor.x = self.cursor.x.saturating_sub(n),
            'E' => {
                self.cursor.y = (self.cursor.y + n).min(self.rows.saturating_sub(1));
                self.cursor.x = 0;
            }
            'F' => {
                self.cursor.y = self.cursor.y.saturating_sub(n);
                self.cursor.x = 0;
            }
            'G' | '`' => self.cursor.x = (arg(0, 1) as usize).saturating_sub(1).min(self.cols.saturating_sub(1)),
            'd' => self.cursor.y = (arg(0, 1) as usize).saturating_sub(1).min(self.rows.saturating_sub(1)),
            'H' | 'f' => {
                self.cursor.y = (arg(0, 1) as usize).saturating_sub(1).min(self.rows.saturating_sub(1));
                self.cursor.x = (arg(1, 1) as usize).saturating_sub(1).min(self.cols.saturating_sub(1));
                self.pending_wrap = false;
            }
            'J' => self.erase_screen(codes.first().copied().unwrap_or(0)),
            'K' => self.erase_line(codes.first().copied().unwrap_or(0)),
            'L' => self.scroll_down(n),
            'M' => self.scroll_up(n),
            '@' => {
                let cols = self.cols;
                let (cx, cy) = (self.cursor.x, self.cursor.y);
                let buf = self.active();
                if let Some(row) = buf.rows.get_mut(cy) {
                    for _ in 0..n {
                        if cx < row.len() {
                            row.insert(cx, Cell::default());
                            row.truncate(cols);
                        }
                    }
                }
            }
            'P' => {
                let cols = self.cols;
                let (cx, cy) = (self.cursor.x, self.cursor.y);
                let buf = self.active();
                if let Some(row) = buf.rows.get_mut(cy) {
                    for _ in 0..n {
                        if cx < row.len() {
                            row.remove(cx);
                        }
                    }
                    row.resize(cols, Cell::default());
                }
            }
            'X' => {
                let cols = self.cols;
                let (cx, cy) = (self.cursor.x, self.cursor.y);
                let buf = self.active();
                if let Some(row) = buf.rows.get_mut(cy) {
                    for x in cx..(cx + n).min(cols) {
                        row[x] = Cell::default();
                    }
                }
            }
            'S' => self.scroll_up(n),
            'T' => self.scroll_down(n),
            'r' => {
                let top = arg(0, 1) as usize - 1;
                let bottom = (arg(1, self.rows as u16) as usize).saturating_sub(1).min(self.rows.saturating_sub(1));
                if top < bottom {
                    self.scroll_top = top;
                    self.scroll_bottom = bottom;
                } else {
                    self.scroll_top = 0;
                    self.scroll_bottom = self.rows.saturating_sub(1);
                }
                self.cursor = Cursor::default();
            }
            's' if !private => self.saved_cursor = Some(self.cursor),
            'u' if !private => {
                if let Some(c) = self.saved_cursor.take() {
                    self.cursor = c;
                }
            }
            'h' | 'l' if private => {
                let enable = action == 'h';
                for code in &codes {
                    match *code {
                        1049 => self.set_alt_screen(enable, true),
                        47 | 1047 => self.set_alt_screen(enable, false),
                        25 => self.cursor_visible = enable,
                        7 => self.auto_wrap = enable,
                        _ => {}
                    }
                }
            }
            'm' => self.apply_sgr(&codes),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        match (intermediates.first(), byte) {
            (None, b'c') => self.reset(),
            (None, b'7') => self.saved_cursor = Some(self.cursor),
            (None, b'8') => {
                if let Some(c) = self.saved_cursor.take() {
                    self.cursor = c;
                }
            }
            (None, b'D') => self.line_feed(),
            (None, b'M') => self.reverse_index(),
            (None, b'E') => {
                self.cursor.x = 0;
                self.line_feed();
            }
            _ => {}
        }
    }
}

impl GridState {
    fn apply_sgr(&mut self, codes: &[u16]) {
        if codes.is_empty() {
            self.pen = Pen::default();
            return;
        }
        let mut i = 0;
        while i < codes.len() {
            match codes[i] {
                0 => self.pen = Pen::default(),
                1 => self.pen.bold = true,
                3 => self.pen.italic = true,
                4 => self.pen.underline = true,
                7 => self.pen.inverse = true,
                22 => self.pen.bold = false,
                23 => self.pen.italic = false,
                24 => self.pen.underline = false,
                27 => self.pen.inverse = false,
                30..=37 => self.pen.fg = Color::Indexed((codes[i] - 30) as u8),
                38 => {
                    i += self.parse_extended_color(&codes[i + 1..], true);
                }
                39 => self.pen.fg = Color::Default,
                40..=47 => self.pen.bg = Color::Indexed((codes[i] - 40) as u8),
                48 => {
                    i += self.parse_extended_color(&codes[i + 1..], false);
                }
                49 => self.pen.bg = Color::Default,
                90..=97 => self.pen.fg = Color::Indexed((codes[i] - 90 + 8) as u8),
                100..=107 => self.pen.bg = Color::Indexed((codes[i] - 100 + 8) as u8),
                _ => {}
            }
            i += 1;
        }
    }

    /// Parses `5;n` (indexed) or `2;r;g;b` (truecolor) following a 38/48 code. Returns
    /// the number of extra codes consumed so the caller can skip past them.
    fn parse_extended_color(&mut self, rest: &[u16], foreground: bool) -> usize {
        match rest.first() {
            Some(5) => {
                let idx = rest.get(1).copied().unwrap_or(0) as u8;
                if foreground {
                    self.pen.fg = Color::Indexed(idx);
                } else {
                    self.pen.bg = Color::Indexed(idx);
                }
                2
            }
            Some(2) => {
                let r = rest.get(1).copied().unwrap_or(0) as u8;
                let g = rest.get(2).copied().unwrap_or(0) as u8;
                let b = rest.get(3).copied().unwrap_or(0) as u8;
                if foreground {
                    self.pen.fg = Color::Rgb(r, g, b);
                } else {
                    self.pen.bg = Color::Rgb(r, g, b);
                }
                4
            }
            _ => 0,
        }
    }
}

/// The public, per-session VT model. Feed it the PTY's raw byte stream; ask it for a
/// binary [`Self::snapshot`] on demand.
pub struct TerminalModel {
    parser: Parser,
    grid: GridState,
}

impl TerminalModel {
    pub fn new(cols: u16, rows: u16, scrollback_cap: usize) -> Self {
        Self { parser: Parser::new(), grid: GridState::new(cols, rows, scrollback_cap) }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let parser = &mut self.parser;
        let grid = &mut self.grid;
        parser.advance(grid, bytes);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.grid.resize(cols, rows);
    }

    pub fn cols(&self) -> u16 {
        self.grid.cols as u16
    }

    pub fn rows(&self) -> u16 {
        self.grid.rows as u16
    }

    /// Encodes the binary VT snapshot (§3). `cols_override`/`rows_override` patch only
    /// the header fields; the emitted cell grid always reflects the true VT state.
    pub fn snapshot(&self, cols_override: Option<u32>, rows_override: Option<u32>) -> Vec<u8> {
        let buf = if self.grid.alt_active { &self.grid.alt } else { &self.grid.primary };
        let mut out = Vec::new();
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.push(SNAPSHOT_VERSION);
        out.push(if self.grid.alt_active { 0x01 } else { 0x00 });
        out.extend_from_slice(&cols_override.unwrap_or(self.grid.cols as u32).to_le_bytes());
        out.extend_from_slice(&rows_override.unwrap_or(self.grid.rows as u32).to_le_bytes());
        out.extend_from_slice(&(self.grid.cursor.x as u32).to_le_bytes());
        out.extend_from_slice(&(self.grid.cursor.y as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // viewport_y: no scrollback scrolling exposed yet
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved

        for row in buf.rows.iter() {
            if row.iter().all(|c| c.ch == ' ' && c.width != 0 && c.pen == Pen::default()) {
                out.push(ROW_MARKER_EMPTY);
                continue;
            }
            out.push(ROW_MARKER_CONTENT);
            for cell in row {
                out.push(cell.pen.attr_byte());
                let cp = cell.ch as u32;
                if cp <= 0x7F {
                    out.push(cp as u8);
                } else {
                    let mut tmp = [0u8; 4];
                    let s = cell.ch.encode_utf8(&mut tmp);
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
        out
    }

    /// Plain-text rendering of the current screen. With `styles`, interleaves minimal SGR
    /// escapes so fg/bg/bold/underline survive a re-render.
    pub fn text(&self, styles: bool) -> String {
        let buf = if self.grid.alt_active { &self.grid.alt } else { &self.grid.primary };
        let mut out = String::new();
        for (i, row) in buf.rows.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let mut current = Pen::default();
            let mut line = String::new();
            for cell in row {
                if cell.width == 0 {
                    continue;
                }
                if styles && cell.pen != current {
                    line.push_str(&sgr_for(&cell.pen));
                    current = cell.pen;
                }
                line.push(cell.ch);
            }
            if styles && current != Pen::default() {
                line.push_str("\x1b[0m");
            }
            out.push_str(line.trim_end());
        }
        out
    }
}

fn sgr_for(pen: &Pen) -> String {
    let mut codes = vec!["0".to_string()];
    if pen.bold {
        codes.push("1".into());
    }
    if pen.italic {
        codes.push("3".into());
    }
    if pen.underline {
        codes.push("4".into());
    }
    if pen.inverse {
        codes.push("7".into());
    }
    match pen.fg {
        Color::Default => {}
        Color::Indexed(i) if i < 8 => codes.push((30 + i).to_string()),
        Color::Indexed(i) if i < 16 => codes.push((90 + (i - 8)).to_string()),
        Color::Indexed(i) => codes.push(format!("38;5;{}", i)),
        Color::Rgb(r, g, b) => codes.push(format!("38;2;{};{};{}", r, g, b)),
    }
    match pen.bg {
        Color::Default => {}
        Color::Indexed(i) if i < 8 => codes.push((40 + i).to_string()),
        Color::Indexed(i) if i < 16 => codes.push((100 + (i - 8)).to_string()),
        Color::Indexed(i) => codes.push(format!("48;5;{}", i)),
        Color::Rgb(r, g, b) => codes.push(format!("48;2;{};{};{}", r, g, b)),
    }
    format!("\x1b[{}m", codes.join(";"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism_same_bytes_same_snapshot() {
        let mut a = TerminalModel::new(10, 3, 100);
        let mut b = TerminalModel::new(10, 3, 100);
        let input = b"hello\r\nworld\x1b[1mBOLD\x1b[0m";
        a.feed(input);
        b.feed(input);
        assert_eq!(a.snapshot(None, None), b.snapshot(None, None));
    }

    #[test]
    fn prune_round_trip_matches_fresh_feed() {
        let mut full = TerminalModel::new(10, 3, 100);
        full.feed(b"A\nB\n\x1b[3JC\n");
        let mut fresh = TerminalModel::new(10, 3, 100);
        fresh.feed(b"C\n");
        assert_eq!(full.snapshot(None, None), fresh.snapshot(None, None));
    }

    #[test]
    fn snapshot_header_overrides_cols_rows_only() {
        let mut t = TerminalModel::new(10, 3, 100);
        t.feed(b"hi");
        let snap = t.snapshot(Some(120), Some(40));
        assert_eq!(&snap[0..2], b"VT");
        let cols = u32::from_le_bytes(snap[4..8].try_into().unwrap());
        let rows = u32::from_le_bytes(snap[8..12].try_into().unwrap());
        assert_eq!(cols, 120);
        assert_eq!(rows, 40);
    }

    #[test]
    fn resize_preserves_existing_content() {
        let mut t = TerminalModel::new(5, 2, 10);
        t.feed(b"ab");
        t.resize(10, 4);
        assert_eq!(t.cols(), 10);
        assert_eq!(t.rows(), 4);
    }

    #[test]
    fn cursor_wraps_at_end_of_line() {
        let mut t = TerminalModel::new(3, 2, 10);
        t.feed(b"abcd");
        assert_eq!(t.grid.cursor.y, 1);
    }

    #[test]
    fn alt_screen_round_trip_restores_primary() {
        let mut t = TerminalModel::new(10, 3, 10);
        t.feed(b"primary");
        t.feed(b"\x1b[?1049h");
        t.feed(b"alt content");
        t.feed(b"\x1b[?1049l");
        let text = t.text(false);
        assert!(text.contains("primary"));
    }
}
