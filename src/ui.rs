use dialoguer::console::style;

/// Colored operator status lines. In JSON mode they go to stderr so stdout
/// stays machine-readable.
#[derive(Debug, Clone, Copy)]
pub struct Ui {
    json: bool,
}

impl Ui {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn phase(&self, step: usize, total: usize, title: &str) {
        self.emit(format!(
            "{} {}",
            style(format!("[{step}/{total}]")).bold().cyan(),
            style(title).bold()
        ));
    }

    pub fn ok(&self, message: &str) {
        self.emit(format!("  {} {message}", style("✓").green()));
    }

    pub fn warn(&self, message: &str) {
        self.emit(format!("  {} {}", style("!").yellow(), style(message).yellow()));
    }

    pub fn fail(&self, message: &str) {
        self.emit_err(format!("{} {}", style("✗").red().bold(), style(message).red()));
    }

    pub fn note(&self, message: &str) {
        self.emit(format!("  {}", style(message).dim()));
    }

    pub fn raw_err(&self, line: &str) {
        self.emit_err(line.to_string());
    }

    fn emit(&self, line: String) {
        if self.json {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn emit_err(&self, line: String) {
        eprintln!("{line}");
    }
}
