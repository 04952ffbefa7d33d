//! Narrow interface to the executor of service code
//!
//! Lifecycle hooks, scripts and test suites run outside this crate. The
//! gateway only decides *when* they run; a [`ServiceRuntime`] decides *how*.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Error, Result};
use crate::services::record::ServiceRecord;

#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    async fn setup(&self, record: &ServiceRecord) -> Result<()>;
    async fn teardown(&self, record: &ServiceRecord) -> Result<()>;
    fn list_scripts(&self, record: &ServiceRecord) -> Vec<ScriptInfo>;
    async fn run_script(&self, record: &ServiceRecord, script: &str, args: Value) -> Result<Value>;
    async fn run_tests(&self, record: &ServiceRecord, grep: Option<&str>) -> Result<TestReport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub name: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub title: String,
    #[serde(rename = "fullTitle")]
    pub full_title: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub tests: Vec<TestCase>,
}

impl TestReport {
    pub fn count(&self, status: TestStatus) -> usize {
        self.tests.iter().filter(|t| t.status == status).count()
    }

    pub fn duration_ms(&self) -> u64 {
        self.tests.iter().map(|t| t.duration_ms).sum()
    }

    pub fn stats(&self) -> Value {
        serde_json::json!({
            "tests": self.tests.len(),
            "passes": self.count(TestStatus::Passed),
            "failures": self.count(TestStatus::Failed),
            "pending": self.count(TestStatus::Pending),
            "duration": self.duration_ms(),
        })
    }
}

/// How a test report is rendered for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reporter {
    #[default]
    Default,
    /// One JSON array per line
    Stream,
    Tap,
    Xunit,
}

impl Reporter {
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name.unwrap_or("default") {
            "default" | "json" => Ok(Reporter::Default),
            "stream" => Ok(Reporter::Stream),
            "tap" => Ok(Reporter::Tap),
            "xunit" => Ok(Reporter::Xunit),
            other => Err(Error::OptionsMalformed(format!("unknown reporter {}", other))),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Reporter::Default => "application/json",
            Reporter::Stream => "application/x-ldjson",
            Reporter::Tap => "text/plain; charset=utf-8",
            Reporter::Xunit => "application/xml",
        }
    }
}

/// Rendered lines (stream, tap) or a single document (default, xunit)
pub fn render_report(report: &TestReport, reporter: Reporter) -> Vec<String> {
    match reporter {
        Reporter::Default => vec![serde_json::json!({
            "stats": report.stats(),
            "tests": report.tests,
        })
        .to_string()],
        Reporter::Stream => {
            let mut lines = vec![serde_json::json!(["start", {"total": report.tests.len()}]).to_string()];
            for test in &report.tests {
                let event = match test.status {
                    TestStatus::Passed => "pass",
                    TestStatus::Failed => "fail",
                    TestStatus::Pending => "pending",
                };
                lines.push(serde_json::json!([event, test]).to_string());
            }
            lines.push(serde_json::json!(["end", report.stats()]).to_string());
            lines
        }
        Reporter::Tap => {
            let mut lines = vec![format!("1..{}", report.tests.len())];
            for (i, test) in report.tests.iter().enumerate() {
                let line = match test.status {
                    TestStatus::Passed => format!("ok {} {}", i + 1, test.full_title),
                    TestStatus::Pending => format!("ok {} {} # SKIP -", i + 1, test.full_title),
                    TestStatus::Failed => format!("not ok {} {}", i + 1, test.full_title),
                };
                lines.push(line);
                if let Some(error) = &test.error {
                    lines.push(format!("  {}", error));
                }
            }
            lines.push(format!("# tests {}", report.tests.len()));
            lines.push(format!("# pass {}", report.count(TestStatus::Passed)));
            lines.push(format!("# fail {}", report.count(TestStatus::Failed)));
            lines
        }
        Reporter::Xunit => {
            let mut xml = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuite name=\"minisvc\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{}\">\n",
                report.tests.len(),
                report.count(TestStatus::Failed),
                report.count(TestStatus::Pending),
                report.duration_ms() as f64 / 1000.0,
            );
            for test in &report.tests {
                xml.push_str(&format!(
                    "  <testcase classname=\"{}\" name=\"{}\" time=\"{}\"",
                    xml_escape(&test.full_title),
                    xml_escape(&test.title),
                    test.duration_ms as f64 / 1000.0,
                ));
                match (test.status, &test.error) {
                    (TestStatus::Failed, error) => xml.push_str(&format!(
                        "><failure message=\"{}\"/></testcase>\n",
                        xml_escape(error.as_deref().unwrap_or("failed"))
                    )),
                    (TestStatus::Pending, _) => xml.push_str("><skipped/></testcase>\n"),
                    (TestStatus::Passed, _) => xml.push_str("/>\n"),
                }
            }
            xml.push_str("</testsuite>");
            vec![xml]
        }
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Runtime for nodes that do not execute service code. Declared scripts
/// succeed with `null`; hooks are no-ops; test suites are empty.
#[derive(Debug, Default)]
pub struct NoopRuntime;

#[async_trait]
impl ServiceRuntime for NoopRuntime {
    async fn setup(&self, record: &ServiceRecord) -> Result<()> {
        tracing::debug!("setup hook for {} (noop)", record.mount);
        Ok(())
    }

    async fn teardown(&self, record: &ServiceRecord) -> Result<()> {
        tracing::debug!("teardown hook for {} (noop)", record.mount);
        Ok(())
    }

    fn list_scripts(&self, record: &ServiceRecord) -> Vec<ScriptInfo> {
        record
            .manifest
            .scripts
            .iter()
            .map(|(name, title)| ScriptInfo {
                name: name.clone(),
                title: title.clone(),
            })
            .collect()
    }

    async fn run_script(&self, record: &ServiceRecord, script: &str, _args: Value) -> Result<Value> {
        if !record.manifest.scripts.contains_key(script) {
            return Err(Error::ScriptNotFound {
                mount: record.mount.clone(),
                script: script.to_string(),
            });
        }
        Ok(Value::Null)
    }

    async fn run_tests(&self, _record: &ServiceRecord, _grep: Option<&str>) -> Result<TestReport> {
        Ok(TestReport::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::record::{Manifest, ServiceMode};
    use std::collections::BTreeMap;

    fn report() -> TestReport {
        TestReport {
            tests: vec![
                TestCase {
                    title: "works".into(),
                    full_title: "api works".into(),
                    status: TestStatus::Passed,
                    duration_ms: 3,
                    error: None,
                },
                TestCase {
                    title: "fails".into(),
                    full_title: "api fails".into(),
                    status: TestStatus::Failed,
                    duration_ms: 2,
                    error: Some("expected <1>".into()),
                },
            ],
        }
    }

    #[test]
    fn test_reporter_parse() {
        assert_eq!(Reporter::parse(None).unwrap(), Reporter::Default);
        assert_eq!(Reporter::parse(Some("tap")).unwrap(), Reporter::Tap);
        assert!(Reporter::parse(Some("html")).is_err());
    }

    #[test]
    fn test_tap_and_stream_rendering() {
        let tap = render_report(&report(), Reporter::Tap);
        assert_eq!(tap[0], "1..2");
        assert_eq!(tap[1], "ok 1 api works");
        assert_eq!(tap[2], "not ok 2 api fails");

        let stream = render_report(&report(), Reporter::Stream);
        assert_eq!(stream.len(), 4);
        let end: Value = serde_json::from_str(&stream[3]).unwrap();
        assert_eq!(end[0], "end");
        assert_eq!(end[1]["failures"], 1);
    }

    #[test]
    fn test_xunit_escapes() {
        let xml = render_report(&report(), Reporter::Xunit).remove(0);
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("message=\"expected &lt;1&gt;\""));
    }

    #[tokio::test]
    async fn test_noop_runtime_rejects_undeclared_scripts() {
        let mut manifest = Manifest::new("demo", "1.0.0");
        manifest.scripts.insert("migrate".into(), "Run migrations".into());
        let record = ServiceRecord {
            mount: "/demo".into(),
            manifest,
            bundle_ref: None,
            checksum: "c".into(),
            legacy: false,
            mode: ServiceMode::Production,
            configuration: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            installed_at: String::new(),
            updated_at: String::new(),
        };
        let runtime = NoopRuntime;
        assert_eq!(runtime.list_scripts(&record).len(), 1);
        assert_eq!(
            runtime.run_script(&record, "migrate", Value::Null).await.unwrap(),
            Value::Null
        );
        assert!(matches!(
            runtime.run_script(&record, "drop", Value::Null).await,
            Err(Error::ScriptNotFound { .. })
        ));
    }
}
