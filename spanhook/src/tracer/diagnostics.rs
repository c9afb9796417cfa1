use aya::programs::ProgramError;

/// Verifier log of a program rejected by the kernel, if `err` carries one.
#[must_use]
pub fn verifier_log(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| match cause.downcast_ref::<ProgramError>()? {
        ProgramError::LoadError { verifier_log, .. } => Some(verifier_log.to_string()),
        _ => None,
    })
}

/// Print the verifier log to stderr
///
/// The log is the only useful information when the kernel rejects a
/// program, and it does not fit in a log line.
pub fn print_verifier_error_info(err: &anyhow::Error) {
    if let Some(log) = verifier_log(err) {
        eprintln!("Error Log:\n {log}");
    }
}
