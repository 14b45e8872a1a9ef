//! Display module - Presentation of the polled team
//!
//! The poller hands every fresh team to a `Presenter`. The terminal
//! presenter lays the team out as six fixed rows, one per slot.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::model::PartyMember;
use crate::team::TEAM_SLOTS;

/// Placeholder shown for slots without a member
pub const EMPTY_SLOT_LABEL: &str = "—";

/// Receives each freshly assembled team
pub trait Presenter: Send {
    /// Replace whatever is shown with `team`
    fn update(&mut self, team: &[PartyMember]) -> io::Result<()>;
}

/// Path of the sprite for `image_index`
pub fn sprite_path(sprite_dir: &Path, image_index: u16) -> PathBuf {
    sprite_dir.join(format!("{}.png", image_index))
}

/// Renders the team as text rows
pub struct ConsolePresenter<W> {
    out: W,
    sprite_dir: PathBuf,
    clear_screen: bool,
}

impl ConsolePresenter<io::Stdout> {
    /// Presenter writing to stdout, redrawing in place
    pub fn stdout(sprite_dir: impl Into<PathBuf>) -> Self {
        Self {
            out: io::stdout(),
            sprite_dir: sprite_dir.into(),
            clear_screen: true,
        }
    }
}

impl<W: Write + Send> ConsolePresenter<W> {
    pub fn new(out: W, sprite_dir: impl Into<PathBuf>) -> Self {
        Self {
            out,
            sprite_dir: sprite_dir.into(),
            clear_screen: false,
        }
    }

    fn render(&mut self, team: &[PartyMember]) -> io::Result<()> {
        if self.clear_screen {
            // ANSI: clear screen, cursor home
            write!(self.out, "\x1b[2J\x1b[H")?;
        }

        writeln!(self.out, "Party ({}/{})", team.len(), TEAM_SLOTS)?;
        for slot in 0..TEAM_SLOTS {
            match team.get(slot) {
                Some(member) => writeln!(
                    self.out,
                    "  {}. {:<10} Lv {:>3}  #{:<4} {}",
                    slot + 1,
                    member.nickname(),
                    member.level,
                    member.species_id,
                    sprite_path(&self.sprite_dir, member.image_index).display()
                )?,
                None => writeln!(self.out, "  {}. {}", slot + 1, EMPTY_SLOT_LABEL)?,
            }
        }
        self.out.flush()
    }
}

impl<W: Write + Send> Presenter for ConsolePresenter<W> {
    fn update(&mut self, team: &[PartyMember]) -> io::Result<()> {
        self.render(team)
    }
}
