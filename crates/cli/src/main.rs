use std::process::ExitCode;

fn main() -> ExitCode {
    bookdesk_cli::run()
}
