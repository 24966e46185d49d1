//! Console input parsing.
//!
//! A keyboard-wedge scanner types the payload followed by Enter, so any line
//! not starting with `:` is a scan. Form fields on `:confirm` are separated
//! by `|` and interpreted according to the session mode.

use equipment_ledger_runtime::{BatchMode, ConfirmDetails, SessionMode};
use thiserror::Error;

/// One line of operator input.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// A scanned payload
    Scan(String),
    /// Switch session mode
    Mode(SessionMode),
    /// Confirm the open session with a form
    Confirm(ConfirmDetails),
    /// Cancel the open session
    Cancel,
    /// Show the session state
    Status,
    /// Print the recent-activity timeline
    Timeline,
    /// Print loans grouped by borrower
    Borrowers,
    /// Run the consistency audit
    Audit,
    /// Flip past-due loans to overdue
    Overdue,
    /// Rewrite one item's projection from the ledger
    Resync(String),
    /// Print the command list
    Help,
    /// Exit
    Quit,
}

/// Input that is not a valid command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown `:command`
    #[error("unknown command `:{0}` (try :help)")]
    Unknown(String),
    /// Unknown mode name
    #[error("unknown mode `{0}`, expected loan, return or classroom")]
    Mode(String),
    /// A required argument is missing
    #[error("usage: {0}")]
    Usage(&'static str),
    /// Unknown batch direction
    #[error("unknown direction `{0}`, expected out or in")]
    Direction(String),
}

/// Help text listing every command.
pub const HELP: &str = "\
<scan>                               scanned code (any line without a leading colon)
:mode loan|return|classroom          switch session mode (idle only)
:confirm borrower[|destination|purpose|notes]        single loan
:confirm returned_by[|received_by|notes]             single return
:confirm classroom[|out|in][|purpose|notes]          classroom batch
:cancel                              cancel the open session
:status                              show the open session
:timeline                            recent activity
:borrowers                           loans by borrower
:audit                               compare ledger and inventory
:overdue                             mark past-due loans overdue
:resync <code>                       rewrite one item from the ledger
:quit";

fn field(fields: &[&str], index: usize) -> Option<String> {
    fields
        .get(index)
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(str::to_string)
}

fn parse_mode(arg: &str) -> Result<SessionMode, ParseError> {
    match arg.trim().to_lowercase().as_str() {
        "loan" | "out" => Ok(SessionMode::SingleLoan),
        "return" | "in" => Ok(SessionMode::SingleReturn),
        "classroom" | "batch" => Ok(SessionMode::ClassroomBatch),
        other => Err(ParseError::Mode(other.to_string())),
    }
}

fn parse_confirm(args: &str, mode: SessionMode) -> Result<ConfirmDetails, ParseError> {
    let fields: Vec<&str> = args.split('|').collect();
    match mode {
        SessionMode::SingleLoan => Ok(ConfirmDetails::Loan {
            borrower_key: field(&fields, 0).unwrap_or_default(),
            destination: field(&fields, 1).unwrap_or_default(),
            purpose: field(&fields, 2).unwrap_or_default(),
            notes: field(&fields, 3),
            expected_return_at: None,
        }),
        SessionMode::SingleReturn => Ok(ConfirmDetails::Return {
            returned_by: field(&fields, 0).unwrap_or_default(),
            received_by: field(&fields, 1),
            notes: field(&fields, 2),
        }),
        SessionMode::ClassroomBatch => {
            let classroom_label = field(&fields, 0).unwrap_or_default();
            let direction = match field(&fields, 1).map(|d| d.to_lowercase()) {
                None => BatchMode::Loan,
                Some(d) if d == "out" => BatchMode::Loan,
                Some(d) if d == "in" => BatchMode::Return,
                Some(d) => return Err(ParseError::Direction(d)),
            };
            Ok(ConfirmDetails::Classroom {
                classroom_label,
                direction,
                purpose: field(&fields, 2).unwrap_or_default(),
                notes: field(&fields, 3),
            })
        },
    }
}

/// Parse one input line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns [`ParseError`] for unknown commands or malformed arguments.
pub fn parse(line: &str, mode: SessionMode) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix(':') else {
        return Ok(Some(Command::Scan(line.to_string())));
    };

    let (name, args) = command.split_once(' ').unwrap_or((command, ""));
    let parsed = match name.to_lowercase().as_str() {
        "mode" => Command::Mode(parse_mode(args)?),
        "confirm" | "ok" => Command::Confirm(parse_confirm(args, mode)?),
        "cancel" => Command::Cancel,
        "status" => Command::Status,
        "timeline" => Command::Timeline,
        "borrowers" => Command::Borrowers,
        "audit" => Command::Audit,
        "overdue" => Command::Overdue,
        "resync" => match args.trim() {
            "" => return Err(ParseError::Usage(":resync <code>")),
            code => Command::Resync(code.to_string()),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(parsed))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_scans() {
        assert_eq!(
            parse("  QR-0042 \n", SessionMode::SingleLoan).unwrap(),
            Some(Command::Scan("QR-0042".into()))
        );
        assert_eq!(parse("   ", SessionMode::SingleLoan).unwrap(), None);
    }

    #[test]
    fn confirm_reads_fields_for_the_current_mode() {
        let loan = parse(":confirm ana@school.edu | Lab 3 | robotics", SessionMode::SingleLoan)
            .unwrap()
            .unwrap();
        assert_eq!(
            loan,
            Command::Confirm(ConfirmDetails::Loan {
                borrower_key: "ana@school.edu".into(),
                destination: "Lab 3".into(),
                purpose: "robotics".into(),
                notes: None,
                expected_return_at: None,
            })
        );

        let ret = parse(":confirm Ana|Marta", SessionMode::SingleReturn).unwrap().unwrap();
        assert!(matches!(
            ret,
            Command::Confirm(ConfirmDetails::Return { ref returned_by, received_by: Some(ref r), notes: None })
                if returned_by == "Ana" && r == "Marta"
        ));
    }

    #[test]
    fn classroom_direction_defaults_to_out() {
        let Some(Command::Confirm(ConfirmDetails::Classroom { classroom_label, direction, .. })) =
            parse(":confirm 201", SessionMode::ClassroomBatch).unwrap()
        else {
            panic!("expected a classroom form");
        };
        assert_eq!(classroom_label, "201");
        assert_eq!(direction, BatchMode::Loan);

        let Some(Command::Confirm(ConfirmDetails::Classroom { direction, purpose, .. })) =
            parse(":confirm 201|in|end of class", SessionMode::ClassroomBatch).unwrap()
        else {
            panic!("expected a classroom form");
        };
        assert_eq!(direction, BatchMode::Return);
        assert_eq!(purpose, "end of class");

        assert_eq!(
            parse(":confirm 201|sideways", SessionMode::ClassroomBatch),
            Err(ParseError::Direction("sideways".into()))
        );
    }

    #[test]
    fn rejects_unknown_commands_and_modes() {
        assert_eq!(
            parse(":launch", SessionMode::SingleLoan),
            Err(ParseError::Unknown("launch".into()))
        );
        assert_eq!(
            parse(":mode lunch", SessionMode::SingleLoan),
            Err(ParseError::Mode("lunch".into()))
        );
        assert!(matches!(
            parse(":resync", SessionMode::SingleLoan),
            Err(ParseError::Usage(_))
        ));
        assert_eq!(
            parse(":mode classroom", SessionMode::SingleLoan).unwrap(),
            Some(Command::Mode(SessionMode::ClassroomBatch))
        );
    }
}
