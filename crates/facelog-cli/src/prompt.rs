use facelog_core::form::{self, EnrollmentForm};
use std::io::{self, BufRead, Write};

/// Ask for every field still blank in `form`, one line each.
///
/// Stops quietly at end of input; whatever is still blank is left for
/// validation to report.
pub fn fill_missing<R: BufRead, W: Write>(
    form: &mut EnrollmentForm,
    mut input: R,
    mut output: W,
) -> io::Result<()> {
    let fields = [
        (form::FIELD_NAME, &mut form.name),
        (form::FIELD_CLASS, &mut form.class),
        (form::FIELD_ROLL_NO, &mut form.roll_no),
        (form::FIELD_SECTION, &mut form.section),
    ];
    for (label, value) in fields {
        if !value.trim().is_empty() {
            continue;
        }
        write!(output, "{label}: ")?;
        output.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        *value = line.trim_end_matches(['\r', '\n']).to_string();
    }
    Ok(())
}
