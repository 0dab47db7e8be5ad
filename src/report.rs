use std::fmt::Write;

/// Outcome of one probe or one recording transfer
#[derive(Clone, Debug, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// A batch of results rendered into a single email
#[derive(Clone, Debug, Default)]
pub struct Report {
    pub subject: String,
    pub results: Vec<CheckResult>,
}

impl Report {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: CheckResult) {
        if result.passed {
            tracing::info!("[{}] ok: {}", result.name, result.detail);
        } else {
            tracing::warn!("[{}] FAILED: {}", result.name, result.detail);
        }
        self.results.push(result);
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }

    pub fn text_body(&self) -> String {
        let mut body = String::new();
        let _ = writeln!(
            body,
            "Network PVR report ({})",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(
            body,
            "{} of {} checks passed.\n",
            self.results.len() - self.failures(),
            self.results.len()
        );

        for result in &self.results {
            let mark = if result.passed { "OK  " } else { "FAIL" };
            let _ = writeln!(body, "[{}] {}: {}", mark, result.name, result.detail);
        }

        body
    }

    pub fn html_body(&self) -> String {
        let mut body = String::from("<html><body>\n<p>Network PVR report</p>\n<table>\n");

        for result in &self.results {
            let colour = if result.passed { "#2e7d32" } else { "#c62828" };
            let mark = if result.passed { "OK" } else { "FAIL" };
            let _ = writeln!(
                body,
                "<tr><td style=\"color:{}\"><b>{}</b></td><td>{}</td><td>{}</td></tr>",
                colour,
                mark,
                escape_html(&result.name),
                escape_html(&result.detail)
            );
        }

        body.push_str("</table>\n</body></html>\n");
        body
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
