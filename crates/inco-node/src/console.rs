use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// Operator-facing output. Every line is prefixed with a local `[HH:MM:SS]`
/// timestamp. Clones share the same writer.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// A console writing into memory, for tests.
    pub fn capture() -> (Self, ConsoleCapture) {
        let capture = ConsoleCapture::default();
        (Self::new(capture.clone()), capture)
    }

    pub fn print_line(&self, message: impl std::fmt::Display) {
        let time = chrono::Local::now().format("%H:%M:%S");
        self.write(&format!("[{time}] {message}\n"));
    }

    /// Print text as-is, without a timestamp.
    pub fn print_raw(&self, text: &str) {
        self.write(text);
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(text.as_bytes()).ok();
        out.flush().ok();
    }
}

/// In-memory sink behind [`Console::capture`].
#[derive(Clone, Default)]
pub struct ConsoleCapture(Arc<Mutex<Vec<u8>>>);

impl ConsoleCapture {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Captured output with the timestamp prefix stripped from every line.
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .lines()
            .map(|l| match l.split_once("] ") {
                Some((stamp, rest)) if stamp.starts_with('[') => rest.to_string(),
                _ => l.to_string(),
            })
            .collect()
    }
}

impl Write for ConsoleCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
