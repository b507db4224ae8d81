//! The interactive front end: reads lines with `rustyline`, and feeds them
//! through the lexer, parser, and executor in this crate.

use argh::FromArgs;
use log::LevelFilter;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use posh::executor;
use posh::job_control::JobControl;
use posh::parser;
use posh::shell::Shell;

#[derive(FromArgs)]
/// posh: an interactive POSIX-like shell core.
struct Args {
    #[argh(option, short = 'c')]
    /// run a single command and exit, instead of starting an interactive prompt
    command: Option<String>,

    #[argh(switch, short = 'v')]
    /// enable verbose (debug-level) logging to stderr
    verbose: bool,
}

fn main() {
    let args: Args = argh::from_env();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    let _ = TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto);

    let job_control = match JobControl::new() {
        Ok(jc) => jc,
        Err(e) => {
            eprintln!("posh: failed to initialize job control: {e}");
            std::process::exit(1);
        }
    };
    let mut shell = Shell::new(job_control);

    if let Some(line) = args.command {
        let code = run_line(&mut shell, &line);
        std::process::exit(shell_exit_code(&shell, code));
    }

    std::process::exit(run_repl(&mut shell));
}

fn run_repl(shell: &mut Shell) -> i32 {
    let mut editor = DefaultEditor::new().expect("failed to initialize line editor");

    loop {
        shell.job_control.drain_sigchld_pipe();
        shell.job_control.reconcile(&mut shell.jobs);
        for line in shell.job_control.notify_completed(&mut shell.jobs) {
            println!("{line}");
        }

        let prompt = if shell.last_exit_code == 0 { "$ " } else { "! " };
        match editor.readline(prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                run_line(shell, &line);
                if shell.should_exit {
                    return shell.exit_code;
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return shell.last_exit_code,
            Err(e) => {
                eprintln!("posh: readline error: {e}");
                return 1;
            }
        }
    }
}

fn run_line(shell: &mut Shell, line: &str) -> i32 {
    match parser::parse(line) {
        Ok(Some(ast)) => executor::execute(shell, &ast),
        Ok(None) => 0,
        Err(e) => {
            eprintln!("posh: {e}");
            2
        }
    }
}

fn shell_exit_code(shell: &Shell, fallback: i32) -> i32 {
    if shell.should_exit { shell.exit_code } else { fallback }
}
