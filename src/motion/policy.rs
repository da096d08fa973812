//! Motion-driven automation
//!
//! On `begin`: snapshot, start recording, start the live preview.
//! On `finished`: stop recording, stop the preview.
//!
//! Commands are posted, not awaited: the watchers run on the control loop
//! itself and the commands are handled right after the current event.

use chrono::{DateTime, Local};
use log::{info, warn};
use std::path::{Path, PathBuf};

use super::beacon::{EventKind, watcher};
use super::orchestrator::{Command, Motion};

pub const STAMP_FORMAT: &str = "%Y.%m.%d-%H.%M.%S";

/// Output path, without extension, for media captured at `now`
pub fn output_base(dir: &Path, now: DateTime<Local>) -> PathBuf {
    dir.join(now.format(STAMP_FORMAT).to_string())
}

/// Watch `motion` for begin and finished events for as long as it lives.
pub fn install(motion: &Motion, output_dir: PathBuf) {
    let weak = motion.downgrade();
    motion.watch(
        EventKind::Begin,
        watcher(move |_| {
            let Some(motion) = weak.upgrade() else { return };
            let base = output_base(&output_dir, Local::now());
            info!("Automation: motion began, capturing to {}", base.display());
            post_all(
                &motion,
                [
                    Command::Snapshot(base.clone()),
                    Command::StartCapture(base),
                    Command::StartLive,
                ],
            );
        }),
    );

    let weak = motion.downgrade();
    motion.watch(
        EventKind::Finished,
        watcher(move |_| {
            let Some(motion) = weak.upgrade() else { return };
            info!("Automation: motion finished");
            post_all(&motion, [Command::StopCapture, Command::StopLive]);
        }),
    );
}

fn post_all(motion: &Motion, commands: impl IntoIterator<Item = Command>) {
    for command in commands {
        if let Err(e) = motion.post(command) {
            warn!("Automation: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_output_base() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            output_base(Path::new("/var/cam"), now),
            PathBuf::from("/var/cam/2024.03.09-07.05.01")
        );
    }
}
