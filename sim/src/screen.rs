use common::{SCREEN_BASE, SCREEN_CELLS, SCREEN_COLS, SCREEN_ROWS};

use crate::Ram;

/// Seam between the CPU and the host display. The CPU calls `refresh`
/// every tick (with `render` mirroring the RF line) and polls `power`
/// before each cycle; a dead window reads as a halt.
pub trait Screen {
    fn power(&self) -> bool {
        true
    }
    fn refresh(&mut self, ram: &Ram, scp: u8, render: bool);
}

/// Headless stand-in. Always powered, never draws.
pub struct NullScreen;

impl Screen for NullScreen {
    fn refresh(&mut self, _ram: &Ram, _scp: u8, _render: bool) {}
}

/// Draws the 32x8 character window to stdout on each RF pulse. The
/// screen pointer scrolls the window within its 256-cell ring.
pub struct TermScreen {
    frames: u64,
}

impl TermScreen {
    pub fn new() -> TermScreen {
        TermScreen { frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn cell(ram: &Ram, scp: u8, x: usize, y: usize) -> char {
        let slot = (x + SCREEN_COLS * y + SCREEN_CELLS - scp as usize) % SCREEN_CELLS;
        let ch = ram.get(SCREEN_BASE + slot) % 128;
        if ch == 0 {
            ' '
        } else {
            ch as char
        }
    }

    /// One rendered frame of the window at the given scroll position.
    pub fn frame(ram: &Ram, scp: u8) -> String {
        let mut frame = String::with_capacity((SCREEN_COLS + 3) * (SCREEN_ROWS + 2));
        frame.push('+');
        frame.push_str(&"-".repeat(SCREEN_COLS));
        frame.push_str("+\n");
        for y in 0..SCREEN_ROWS {
            frame.push('|');
            for x in 0..SCREEN_COLS {
                frame.push(TermScreen::cell(ram, scp, x, y));
            }
            frame.push_str("|\n");
        }
        frame.push('+');
        frame.push_str(&"-".repeat(SCREEN_COLS));
        frame.push('+');
        frame
    }
}

impl Default for TermScreen {
    fn default() -> TermScreen {
        TermScreen::new()
    }
}

impl Screen for TermScreen {
    fn refresh(&mut self, ram: &Ram, scp: u8, render: bool) {
        if !render {
            return;
        }
        self.frames += 1;
        println!("{}", TermScreen::frame(ram, scp));
    }
}
