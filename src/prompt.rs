//! Interactive input for the upload client.

use crate::envelope::{Operation, Options};
use crate::protocol::option_keys::{ASPECT_RATIO, DURATION, RESOLUTION, START_TIME};
use std::io::{self, BufRead, Write};

fn option_prompt(key: &str) -> String {
    match key {
        RESOLUTION => "Enter the resolution (e.g., 1280x720): ".to_string(),
        ASPECT_RATIO => "Enter the aspect ratio (e.g., 16:9): ".to_string(),
        START_TIME => "Enter the start time (e.g., 00:00:00): ".to_string(),
        DURATION => "Enter the duration (in seconds): ".to_string(),
        other => format!("Enter {}: ", other),
    }
}

pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// One trimmed line. EOF is an error so callers never loop forever.
    pub fn ask(&mut self, prompt: &str) -> io::Result<String> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed"));
        }
        Ok(line.trim().to_string())
    }

    /// Show the operation menu until a number from 1 to 6 is entered.
    pub fn select_operation(&mut self) -> io::Result<Operation> {
        writeln!(self.output, "Please enter a number from 1 to {}:", Operation::ALL.len())?;
        for op in Operation::ALL {
            writeln!(self.output, "{} : {}", op.code(), op.description())?;
        }
        loop {
            let answer = self.ask("Enter your choice: ")?;
            match answer.parse::<i64>().ok().map(Operation::from_code) {
                Some(Ok(op)) => return Ok(op),
                _ => writeln!(
                    self.output,
                    "Invalid choice. Please enter a number between 1 and {}.",
                    Operation::ALL.len()
                )?,
            }
        }
    }

    /// Ask for each required option not already supplied (blank counts as
    /// missing).
    pub fn collect_options(&mut self, operation: Operation, preset: Options) -> io::Result<Options> {
        let mut options = preset;
        for key in operation.required_options() {
            let have = options.get(*key).is_some_and(|v| !v.trim().is_empty());
            if !have {
                let value = self.ask(&option_prompt(key))?;
                options.insert(key.to_string(), value);
            }
        }
        Ok(options)
    }
}
