//! The `toy` command: run a script, or start the REPL with no arguments.

use std::{
    env, fs,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use toy::{ReplProgress, ReplSession, Script, StdPrint};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.get(1) {
        Some(path) => run_file(path),
        None => run_repl(),
    }
}

fn run_file(path: &str) -> ExitCode {
    if !path.ends_with(".toy") {
        eprintln!("error: script path must end in .toy: {path}");
        return ExitCode::FAILURE;
    }
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    // Tolerate executable scripts: a shebang line becomes a comment.
    let source = if let Some(rest) = source.strip_prefix("#!") {
        format!("//{rest}")
    } else {
        source
    };

    let import_dir = std::path::Path::new(path).parent().map(std::path::Path::to_path_buf);
    let mut script = Script::new(source, path);
    if let Some(dir) = import_dir {
        script = script.with_import_dir(dir);
    }

    let compiled = match script.compile() {
        Ok(compiled) => compiled,
        Err(errors) => {
            eprintln!("{errors}");
            return ExitCode::FAILURE;
        }
    };
    match compiled.run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(exception) => {
            eprintln!("{exception}");
            ExitCode::FAILURE
        }
    }
}

fn run_repl() -> ExitCode {
    let mut session = ReplSession::new();
    if let Ok(dir) = env::current_dir() {
        session = session.with_import_dir(dir);
    }
    let mut print = StdPrint::new();
    let stdin = io::stdin();

    loop {
        let prompt = if session.needs_more() { ".. " } else { ">> " };
        print!("{prompt}");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        }
        let line = line.trim_end_matches(['\n', '\r']);

        match session.push_line(line, &mut print) {
            Ok(ReplProgress::NeedMore | ReplProgress::Evaluated) => {}
            Err(err) => eprintln!("{err}"),
        }
    }
    ExitCode::SUCCESS
}
