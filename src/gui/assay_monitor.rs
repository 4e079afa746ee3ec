use std::{io::stdout, time::Duration};

use crate::assay::{AssaySession, SessionState, SessionStatus};
use crate::device_client::DeviceClient;
use crate::gui::error::MonitorError;

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Why [monitor_assay] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The session is no longer running.
    Finished,
    /// A key was pressed.
    Stopped,
}

/// Shows the session status until the assay ends or a key is pressed.
///
/// The monitor only reads the session; stopping the assay afterwards is up
/// to the caller.
pub fn monitor_assay<D: DeviceClient + 'static>(
    session: &AssaySession<D>,
    refresh: Duration,
) -> Result<MonitorExit, MonitorError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let res = run_monitor(&mut terminal, session, refresh);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    res
}

fn run_monitor<B: Backend, D: DeviceClient + 'static>(
    terminal: &mut Terminal<B>,
    session: &AssaySession<D>,
    refresh: Duration,
) -> Result<MonitorExit, MonitorError> {
    loop {
        let status = session.status();
        terminal.draw(|frame| draw(frame, &status))?;
        if status.state != SessionState::Running {
            return Ok(MonitorExit::Finished);
        }

        if event::poll(refresh)? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(MonitorExit::Stopped);
                }
            }
        }
    }
}

fn draw(frame: &mut Frame, status: &SessionStatus) {
    let title = Title::from(" Mouse Joystick Assay ".magenta().bold());
    let instructions = Title::from(Line::from(vec![
        " Stop ".into(),
        "<Any key> ".magenta().bold(),
    ]));
    let block = Block::default()
        .title(title.alignment(Alignment::Center))
        .title(
            instructions
                .alignment(Alignment::Center)
                .position(Position::Bottom),
        )
        .borders(Borders::ALL);

    let lines: Vec<Line> = status_lines(status)
        .into_iter()
        .map(|(label, value)| {
            let value = if label == "Poll error" {
                Span::styled(value, Style::default().fg(Color::Red).bold())
            } else {
                Span::raw(value)
            };
            Line::from(vec![
                Span::styled(format!(" {label:<18}"), Style::default().fg(Color::Cyan)),
                value,
            ])
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), frame.size());
}

/// The label/value pairs the monitor shows for `status`.
pub fn status_lines(status: &SessionStatus) -> Vec<(&'static str, String)> {
    let mut lines = vec![
        ("Session", format!("{:?}", status.state)),
        (
            "Assay directory",
            status
                .assay_dir
                .as_ref()
                .map_or_else(|| "-".to_owned(), |dir| dir.display().to_string()),
        ),
        ("Trials recorded", status.rows_written.to_string()),
    ];

    if let Some(device) = &status.last_status {
        let block = &device.block;
        lines.extend([
            ("Controller state", String::from(device.state.clone())),
            ("Finished trials", device.finished_trial_count.to_string()),
            ("Successful trials", device.successful_trial_count.to_string()),
            ("Set", device.set_in_assay.to_string()),
            (
                "Block",
                format!(
                    "{} trials, torque {}, reward {}, reach {:?}",
                    block.repeat_trial_count,
                    block.pull_torque,
                    block.lickport_reward_duration,
                    block.reach_position
                ),
            ),
        ]);
        if device.assay_aborted {
            lines.push(("Assay aborted", "yes".to_owned()));
        }
    }

    if let Some(e) = &status.last_poll_error {
        lines.push(("Poll error", e.clone()));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_client::{AssayState, AssayStatus, Block};
    use std::path::PathBuf;

    fn idle() -> SessionStatus {
        SessionStatus {
            state: SessionState::Idle,
            assay_dir: None,
            rows_written: 0,
            last_status: None,
            last_poll_error: None,
            polling: false,
        }
    }

    #[test]
    fn idle_session_shows_the_basics() {
        let lines = status_lines(&idle());
        assert_eq!(
            lines,
            vec![
                ("Session", "Idle".to_owned()),
                ("Assay directory", "-".to_owned()),
                ("Trials recorded", "0".to_owned()),
            ]
        );
    }

    #[test]
    fn running_session_shows_the_controller() {
        let status = SessionStatus {
            state: SessionState::Running,
            assay_dir: Some(PathBuf::from("/data/2023-07-22-04-26-40")),
            rows_written: 3,
            last_status: Some(AssayStatus {
                state: AssayState::Running,
                finished_trial_count: 3,
                successful_trial_count: 2,
                block: Block {
                    repeat_trial_count: 5,
                    pull_torque: 50,
                    lickport_reward_duration: 10,
                    reach_position: [100, 200],
                },
                ..Default::default()
            }),
            last_poll_error: Some("device closed the connection".to_owned()),
            polling: false,
        };
        let lines = status_lines(&status);
        let value = |label: &str| {
            lines
                .iter()
                .find(|(l, _)| *l == label)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(value("Session").as_deref(), Some("Running"));
        assert_eq!(value("Trials recorded").as_deref(), Some("3"));
        assert_eq!(value("Controller state").as_deref(), Some("ASSAY_RUNNING"));
        assert_eq!(
            value("Block").as_deref(),
            Some("5 trials, torque 50, reward 10, reach [100, 200]")
        );
        assert_eq!(value("Assay aborted"), None);
        assert_eq!(
            value("Poll error").as_deref(),
            Some("device closed the connection")
        );
    }
}
