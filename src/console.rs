//! Line-oriented operator console
//!
//! Reads commands from stdin, runs them against the session controller and
//! prints controller events as they arrive.

use crate::controller::{ControllerEvent, MarkOutcome, SessionController};
use crate::models::{parse_session_time, NewSession, SessionId, StudentId};
use crate::preferences;
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const HELP: &str = "\
Commands:
  sessions                         refresh and list sessions
  depts                            list departments seen so far
  dept <name>|all                  filter sessions by department
  select <id>                      select an active session
  deselect                         clear the selection (stops capture)
  start                            start capturing frames
  stop                             stop capturing frames
  open <id>                        start a session on the backend
  close <id>                       stop a session on the backend
  create <subject> <dept> <start> <end>
                                   create a session (times as 2024-05-01T09:00)
  mark <student_id>                mark a student present by hand
  students                         reload and list students
  roster                           show the attendance roster
  finalize                         calculate attendance percentages
  status                           show controller status
  help                             show this help
  quit                             exit";

/// Parsed operator command
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Sessions,
    Departments,
    /// `None` clears the filter
    Department(Option<String>),
    Select(SessionId),
    Deselect,
    Start,
    Stop,
    Open(SessionId),
    Close(SessionId),
    Create(NewSession),
    Mark(StudentId),
    Students,
    Roster,
    Finalize,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum ParseError {
    #[error("Unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid {what}: '{value}'")]
    Invalid { what: &'static str, value: String },
}

fn id_arg(arg: Option<&str>, usage: &'static str) -> Result<i64, ParseError> {
    let raw = arg.ok_or(ParseError::Usage(usage))?;
    raw.parse().map_err(|_| ParseError::Invalid {
        what: "id",
        value: raw.to_string(),
    })
}

fn time_arg(raw: &str) -> Result<chrono::NaiveDateTime, ParseError> {
    parse_session_time(raw).ok_or_else(|| ParseError::Invalid {
        what: "time",
        value: raw.to_string(),
    })
}

/// Parse one non-empty console line
pub(crate) fn parse_command(line: &str) -> Result<Command, ParseError> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Err(ParseError::Usage("help"));
    };
    let command = match cmd.to_ascii_lowercase().as_str() {
        "sessions" | "ls" => Command::Sessions,
        "depts" => Command::Departments,
        "dept" => {
            let name = parts.collect::<Vec<_>>().join(" ");
            match name.as_str() {
                "" => return Err(ParseError::Usage("dept <name>|all")),
                "all" | "*" => Command::Department(None),
                _ => Command::Department(Some(name)),
            }
        }
        "select" => Command::Select(SessionId(id_arg(parts.next(), "select <id>")?)),
        "deselect" => Command::Deselect,
        "start" => Command::Start,
        "stop" => Command::Stop,
        "open" => Command::Open(SessionId(id_arg(parts.next(), "open <id>")?)),
        "close" => Command::Close(SessionId(id_arg(parts.next(), "close <id>")?)),
        "create" => {
            const USAGE: &str = "create <subject> <dept> <start> <end>";
            let args: Vec<&str> = parts.collect();
            let [subject, department, start, end] = args.as_slice() else {
                return Err(ParseError::Usage(USAGE));
            };
            let start_time = time_arg(start)?;
            let end_time = time_arg(end)?;
            if end_time <= start_time {
                return Err(ParseError::Invalid {
                    what: "time window",
                    value: format!("{} .. {}", start, end),
                });
            }
            Command::Create(NewSession {
                subject: subject.replace('_', " "),
                department: Some(department.to_string()),
                instructor: None,
                classroom: None,
                start_time,
                end_time,
            })
        }
        "mark" => Command::Mark(StudentId(id_arg(parts.next(), "mark <student_id>")?)),
        "students" => Command::Students,
        "roster" => Command::Roster,
        "finalize" => Command::Finalize,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandStatus {
    Continue,
    Quit,
}

/// Executes commands against the controller, writing to `out`
pub(crate) struct Console<W: Write> {
    controller: Arc<SessionController>,
    out: W,
    /// Save department changes to the preferences file
    persist_filter: bool,
}

impl<W: Write> Console<W> {
    pub fn new(controller: Arc<SessionController>, out: W) -> Self {
        Self {
            controller,
            out,
            persist_filter: true,
        }
    }

    /// Run one input line
    pub async fn execute(&mut self, line: &str) -> io::Result<CommandStatus> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(CommandStatus::Continue);
        }

        let status = match parse_command(line) {
            Ok(command) => self.dispatch(command).await?,
            Err(e) => {
                writeln!(self.out, "{}", e)?;
                CommandStatus::Continue
            }
        };
        self.out.flush()?;
        Ok(status)
    }

    async fn dispatch(&mut self, command: Command) -> io::Result<CommandStatus> {
        let controller = self.controller.clone();
        match command {
            Command::Sessions => {
                if let Err(e) = controller.refresh_sessions().await {
                    writeln!(self.out, "{} (showing last known sessions)", e)?;
                }
                let directory = controller.directory();
                let filter = directory.department_filter();
                let selected = directory.selected_id();
                let sessions = directory.sessions();
                let mut shown = 0;
                for session in sessions
                    .iter()
                    .filter(|s| match filter.as_deref() {
                        Some(d) => s.in_department(d),
                        None => true,
                    })
                {
                    let marker = if Some(session.id) == selected { "*" } else { " " };
                    writeln!(self.out, "{} {}", marker, session.summary())?;
                    shown += 1;
                }
                if shown == 0 {
                    writeln!(self.out, "No sessions")?;
                }
            }
            Command::Departments => {
                let departments = controller.directory().departments();
                if departments.is_empty() {
                    writeln!(self.out, "No departments known yet")?;
                } else {
                    writeln!(self.out, "{}", departments.join(", "))?;
                }
            }
            Command::Department(department) => {
                let dropped = controller.set_department_filter(department.clone());
                if self.persist_filter {
                    if let Err(e) = preferences::set_department_filter(department.as_deref()) {
                        warn!("Failed to save department filter: {}", e);
                    }
                }
                match &department {
                    Some(d) => writeln!(self.out, "Department filter: {}", d)?,
                    None => writeln!(self.out, "Department filter cleared")?,
                }
                if let Some(id) = dropped {
                    writeln!(self.out, "Session {} deselected (outside department filter)", id)?;
                }
                if let Err(e) = controller.refresh_sessions().await {
                    writeln!(self.out, "{}", e)?;
                }
            }
            Command::Select(id) => match controller.select_session(id) {
                Ok(session) => writeln!(self.out, "Selected {}", session.summary())?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Deselect => match controller.deselect() {
                Some(id) => writeln!(self.out, "Session {} deselected", id)?,
                None => writeln!(self.out, "No session selected")?,
            },
            Command::Start => match controller.start_capture() {
                Ok(()) => writeln!(self.out, "Capture started")?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Stop => {
                if controller.stop_capture() {
                    writeln!(self.out, "Capture stopped")?;
                } else {
                    writeln!(self.out, "Capture is not running")?;
                }
            }
            Command::Open(id) => match controller.start_session(id).await {
                Ok(session) => writeln!(self.out, "Started {}", session.summary())?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Close(id) => match controller.stop_session(id).await {
                Ok(session) => writeln!(self.out, "Stopped {}", session.summary())?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Create(new_session) => match controller.create_session(new_session).await {
                Ok(id) => writeln!(self.out, "Created session {}", id)?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Mark(student_id) => match controller.mark_manual(student_id).await {
                Ok(MarkOutcome::Marked(message)) => writeln!(self.out, "{}", message)?,
                Ok(MarkOutcome::AlreadyPresent) => {
                    writeln!(self.out, "Student {} is already present", student_id)?
                }
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Students => {
                if let Err(e) = controller.refresh_students().await {
                    writeln!(self.out, "{} (showing cached students)", e)?;
                }
                let students = controller.students();
                for student in students.iter() {
                    writeln!(
                        self.out,
                        "{:>5} {:<12} {} [{}]",
                        student.id,
                        student.roll_code.as_deref().unwrap_or("-"),
                        student.name,
                        student.department.as_deref().unwrap_or("-")
                    )?;
                }
                writeln!(self.out, "{} students", students.len())?;
            }
            Command::Roster => {
                let roster = controller.roster();
                let Some(session_id) = roster.session_id else {
                    writeln!(self.out, "No roster yet")?;
                    return Ok(CommandStatus::Continue);
                };
                writeln!(
                    self.out,
                    "Session {}: {} present",
                    session_id,
                    roster.entries.len()
                )?;
                for entry in &roster.entries {
                    writeln!(
                        self.out,
                        "{:>5} {:<24} {:>5.2} {:<10} {}",
                        entry.student_id,
                        entry.name,
                        entry.confidence,
                        entry.source,
                        entry.first_seen_at.format("%H:%M:%S")
                    )?;
                }
            }
            Command::Finalize => match controller.finalize_percentages().await {
                Ok(message) => writeln!(self.out, "{}", message)?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            Command::Status => {
                let status = controller.status();
                writeln!(self.out, "State:      {}", status.state)?;
                match &status.selected {
                    Some(session) => writeln!(self.out, "Session:    {}", session.summary())?,
                    None => writeln!(self.out, "Session:    none")?,
                }
                match status.roster_session {
                    Some(id) => writeln!(
                        self.out,
                        "Roster:     {} present (session {})",
                        status.roster_count, id
                    )?,
                    None => writeln!(self.out, "Roster:     empty")?,
                }
                writeln!(self.out, "Connection: {}", controller.connection_state())?;
                writeln!(
                    self.out,
                    "Department: {}",
                    status.department_filter.as_deref().unwrap_or("all")
                )?;
                match status.last_refresh {
                    Some(at) => writeln!(self.out, "Refreshed:  {}", at.format("%H:%M:%S"))?,
                    None => writeln!(self.out, "Refreshed:  never")?,
                }
            }
            Command::Help => writeln!(self.out, "{}", HELP)?,
            Command::Quit => return Ok(CommandStatus::Quit),
        }
        Ok(CommandStatus::Continue)
    }

    /// Print a controller notification
    pub fn print_event(&mut self, event: &ControllerEvent) -> io::Result<()> {
        match event {
            ControllerEvent::SessionAvailable { session, selected } => {
                if *selected {
                    writeln!(self.out, "Selected {}", session.summary())?;
                } else {
                    writeln!(
                        self.out,
                        "Active session {} (type 'select {}')",
                        session.summary(),
                        session.id
                    )?;
                }
            }
            ControllerEvent::SessionCandidates { sessions } => {
                writeln!(self.out, "{} active sessions, select one:", sessions.len())?;
                for session in sessions {
                    writeln!(self.out, "  {}", session.summary())?;
                }
            }
            ControllerEvent::SessionEnded {
                session_id,
                capture_stopped,
            } => {
                if *capture_stopped {
                    writeln!(self.out, "Session {} ended, capture stopped", session_id)?;
                } else {
                    writeln!(self.out, "Session {} ended", session_id)?;
                }
            }
            ControllerEvent::RosterUpdated {
                session_id,
                inserted,
                updated,
                count,
            } => {
                // Repeat sightings only refresh timestamps
                if *inserted > 0 || *updated == 0 {
                    writeln!(
                        self.out,
                        "Session {}: {} present (+{})",
                        session_id, count, inserted
                    )?;
                }
            }
            ControllerEvent::RecognitionError { message } => {
                writeln!(self.out, "Recognition error: {}", message)?;
            }
            ControllerEvent::ConnectionChanged(state) => {
                writeln!(self.out, "Backend connection: {}", state)?;
            }
        }
        self.out.flush()
    }
}

/// Run the console on stdin/stdout until `quit`, end of input or Ctrl-C
pub(crate) async fn run(
    controller: Arc<SessionController>,
    mut events: broadcast::Receiver<ControllerEvent>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console = Console::new(controller, io::stdout());
    writeln!(console.out, "Type 'help' for commands")?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("End of input");
                    break;
                };
                if console.execute(&line).await? == CommandStatus::Quit {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => console.print_event(&event)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Console lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{test_source, RecordingSink};
    use crate::capture::{CaptureGate, FrameScheduler};
    use crate::directory::tests::{session, FakeApi};
    use crate::directory::SessionDirectory;
    use crate::error::ApiError;
    use crate::models::{SessionStatus, Student};
    use std::time::Duration;

    fn console(api: &Arc<FakeApi>) -> Console<Vec<u8>> {
        let directory = SessionDirectory::new(api.clone(), None);
        let scheduler = FrameScheduler::new(
            CaptureGate::new(),
            test_source(),
            Arc::new(RecordingSink::default()),
            Duration::from_secs(1),
        );
        let controller = Arc::new(SessionController::new(
            api.clone(),
            directory,
            scheduler,
            false,
        ));
        let mut console = Console::new(controller, Vec::new());
        console.persist_filter = false;
        console
    }

    fn take_output(console: &mut Console<Vec<u8>>) -> String {
        String::from_utf8(std::mem::take(&mut console.out)).unwrap()
    }

    #[test]
    fn test_parse_ids_and_filters() {
        assert!(matches!(
            parse_command("select 3"),
            Ok(Command::Select(SessionId(3)))
        ));
        assert!(matches!(
            parse_command("  MARK 17 "),
            Ok(Command::Mark(StudentId(17)))
        ));
        assert!(matches!(parse_command("dept all"), Ok(Command::Department(None))));
        match parse_command("dept Computer Science") {
            Ok(Command::Department(Some(d))) => assert_eq!(d, "Computer Science"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_command("select").unwrap_err(),
            ParseError::Usage("select <id>")
        );
        assert_eq!(
            parse_command("close abc").unwrap_err(),
            ParseError::Invalid {
                what: "id",
                value: "abc".to_string()
            }
        );
        assert_eq!(
            parse_command("dance").unwrap_err(),
            ParseError::Unknown("dance".to_string())
        );
    }

    #[test]
    fn test_parse_create() {
        let Ok(Command::Create(new_session)) =
            parse_command("create Data_Structures CS 2024-05-01T09:00 2024-05-01T10:30")
        else {
            panic!("expected create");
        };
        assert_eq!(new_session.subject, "Data Structures");
        assert_eq!(new_session.department.as_deref(), Some("CS"));
        assert_eq!(new_session.start_time.format("%H:%M").to_string(), "09:00");

        assert!(matches!(
            parse_command("create Math CS 2024-05-01T10:00 2024-05-01T09:00"),
            Err(ParseError::Invalid { what: "time window", .. })
        ));
        assert!(matches!(
            parse_command("create Math CS tomorrow 2024-05-01T09:00"),
            Err(ParseError::Invalid { what: "time", .. })
        ));
        assert_eq!(
            parse_command("create Math").unwrap_err(),
            ParseError::Usage("create <subject> <dept> <start> <end>")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_capture_and_quit() {
        let api = Arc::new(FakeApi::default());
        api.push_active(vec![
            session(1, "CS", SessionStatus::Active),
            session(2, "EE", SessionStatus::Active),
        ]);
        let mut console = console(&api);

        console.execute("sessions").await.unwrap();
        let out = take_output(&mut console);
        assert!(out.contains("#1 Subject 1"));
        assert!(out.contains("#2 Subject 2"));

        console.execute("start").await.unwrap();
        assert!(take_output(&mut console).contains("No session selected"));

        console.execute("select 1").await.unwrap();
        assert!(take_output(&mut console).starts_with("Selected #1"));

        console.execute("start").await.unwrap();
        assert_eq!(take_output(&mut console), "Capture started\n");

        console.execute("status").await.unwrap();
        assert!(take_output(&mut console).contains("State:      capturing"));

        console.execute("stop").await.unwrap();
        assert_eq!(take_output(&mut console), "Capture stopped\n");

        assert_eq!(console.execute("quit").await.unwrap(), CommandStatus::Quit);
        console.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_mark_and_roster_output() {
        let api = Arc::new(FakeApi::default());
        api.push_active(vec![session(1, "CS", SessionStatus::Active)]);
        api.students.lock().unwrap().push(Student {
            id: StudentId(7),
            roll_code: Some("CS2023-007".to_string()),
            name: "Asha Verma".to_string(),
            department: Some("CS".to_string()),
        });
        let mut console = console(&api);
        console.execute("sessions").await.unwrap();
        console.execute("students").await.unwrap();
        console.execute("select 1").await.unwrap();
        take_output(&mut console);

        console.execute("mark 7").await.unwrap();
        assert_eq!(take_output(&mut console), "Attendance marked successfully\n");

        console.execute("mark 7").await.unwrap();
        assert_eq!(take_output(&mut console), "Student 7 is already present\n");

        api.push_mark_result(Err(ApiError::ServerError {
            status: 404,
            message: "Student not found".to_string(),
        }));
        console.execute("mark 8").await.unwrap();
        assert_eq!(
            take_output(&mut console),
            "Could not mark student 8: Student not found\n"
        );

        console.execute("roster").await.unwrap();
        let out = take_output(&mut console);
        assert!(out.starts_with("Session 1: 1 present"));
        assert!(out.contains("Asha Verma"));
        assert!(!out.contains("Student 8"));

        console.execute("finalize").await.unwrap();
        assert_eq!(take_output(&mut console), "Attendance percentages calculated\n");
        assert_eq!(*api.finalized.lock().unwrap(), vec![SessionId(1)]);
    }

    #[tokio::test]
    async fn test_department_filter_is_forwarded() {
        let api = Arc::new(FakeApi::default());
        let mut console = console(&api);

        console.execute("dept EE").await.unwrap();
        assert!(take_output(&mut console).starts_with("Department filter: EE"));
        assert_eq!(api.last_department.lock().unwrap().as_deref(), Some("EE"));

        console.execute("dept all").await.unwrap();
        assert!(take_output(&mut console).starts_with("Department filter cleared"));
        assert!(api.last_department.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_department_filter_drops_foreign_selection() {
        let api = Arc::new(FakeApi::default());
        api.push_active(vec![session(1, "CS", SessionStatus::Active)]);
        let mut console = console(&api);
        console.execute("sessions").await.unwrap();
        console.execute("select 1").await.unwrap();
        take_output(&mut console);

        console.execute("dept EE").await.unwrap();
        let out = take_output(&mut console);
        assert!(out.contains("Session 1 deselected (outside department filter)"));
        assert_eq!(console.controller.directory().selected_id(), None);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_known_sessions() {
        let api = Arc::new(FakeApi::default());
        api.push_active(vec![session(3, "CS", SessionStatus::Active)]);
        let mut console = console(&api);
        console.execute("sessions").await.unwrap();
        take_output(&mut console);

        api.push_active_error();
        console.execute("sessions").await.unwrap();
        let out = take_output(&mut console);
        assert!(out.contains("showing last known sessions"));
        assert!(out.contains("#3 Subject 3"));
    }

    #[test]
    fn test_event_printing() {
        let api = Arc::new(FakeApi::default());
        let mut console = console(&api);

        console
            .print_event(&ControllerEvent::SessionEnded {
                session_id: SessionId(4),
                capture_stopped: true,
            })
            .unwrap();
        console
            .print_event(&ControllerEvent::RosterUpdated {
                session_id: SessionId(4),
                inserted: 0,
                updated: 2,
                count: 2,
            })
            .unwrap();
        console
            .print_event(&ControllerEvent::RecognitionError {
                message: "No face detected".to_string(),
            })
            .unwrap();

        assert_eq!(
            take_output(&mut console),
            "Session 4 ended, capture stopped\nRecognition error: No face detected\n"
        );
    }
}
