//! Witness emission
//!
//! The supervisor decides *whether* a witness is written (see
//! [`crate::verdict::decide_witness`]); a [`WitnessWriter`] decides how it
//! looks on disk.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::property::Property;
use crate::verdict::WitnessKind;

/// One step of a counterexample, outermost call first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceStep {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub note: Option<String>,
}

/// Execution path leading to a violation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionTrace {
    pub steps: Vec<TraceStep>,
}

impl ExecutionTrace {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Everything a writer is told about the witness
#[derive(Debug, Clone)]
pub struct WitnessRequest {
    pub kind: WitnessKind,
    pub property: Property,
    pub sources: Vec<PathBuf>,
    pub is_32bit: bool,
    pub trace: Option<ExecutionTrace>,
    pub destination: PathBuf,
}

impl WitnessRequest {
    /// `<stem of first source>.graphml` in `dir`
    pub fn default_destination(sources: &[PathBuf], dir: &Path) -> PathBuf {
        let stem = sources
            .first()
            .and_then(|source| source.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "witness".to_string());
        dir.join(format!("{stem}.graphml"))
    }
}

#[derive(Debug, Error)]
pub enum WitnessError {
    #[error("cannot read source {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write witness {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serializes witness requests
pub trait WitnessWriter: Send + Sync {
    fn write(&self, request: &WitnessRequest) -> Result<(), WitnessError>;
}

/// Writes witnesses as GraphML documents
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphmlWitnessWriter;

impl GraphmlWitnessWriter {
    pub fn new() -> Self {
        Self
    }

    /// Render the document without touching the destination
    pub fn render(&self, request: &WitnessRequest) -> Result<String, WitnessError> {
        let source = request.sources.first();
        let (source_path, source_hash) = match source {
            Some(path) => {
                let content = std::fs::read(path).map_err(|source| WitnessError::Source {
                    path: path.clone(),
                    source,
                })?;
                (path.display().to_string(), sha256_hex(&content))
            }
            None => (String::new(), String::new()),
        };
        let architecture = if request.is_32bit { "32bit" } else { "64bit" };
        let specification = request.property.to_prp();

        let mut doc = String::new();
        doc.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>\n");
        doc.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
        for (id, target) in [
            ("witness-type", "graph"),
            ("sourcecodelang", "graph"),
            ("producer", "graph"),
            ("specification", "graph"),
            ("programfile", "graph"),
            ("programhash", "graph"),
            ("architecture", "graph"),
            ("entry", "node"),
            ("violation", "node"),
            ("enterFunction", "edge"),
            ("startline", "edge"),
            ("originfile", "edge"),
            ("note", "edge"),
        ] {
            let _ = writeln!(
                doc,
                " <key attr.name=\"{id}\" attr.type=\"string\" for=\"{target}\" id=\"{id}\"/>"
            );
        }
        doc.push_str(" <graph edgedefault=\"directed\">\n");
        for (key, value) in [
            ("witness-type", request.kind.as_str()),
            ("sourcecodelang", "C"),
            ("producer", concat!("verirun ", env!("CARGO_PKG_VERSION"))),
            ("specification", specification.trim_end()),
            ("programfile", source_path.as_str()),
            ("programhash", source_hash.as_str()),
            ("architecture", architecture),
        ] {
            let _ = writeln!(doc, "  <data key=\"{key}\">{}</data>", escape(value));
        }

        let steps = request
            .trace
            .as_ref()
            .map(|trace| trace.steps.as_slice())
            .unwrap_or_default();

        doc.push_str("  <node id=\"N0\">\n   <data key=\"entry\">true</data>\n  </node>\n");
        for (i, step) in steps.iter().enumerate() {
            let node = i + 1;
            if node == steps.len() && request.kind == WitnessKind::Violation {
                let _ = writeln!(
                    doc,
                    "  <node id=\"N{node}\">\n   <data key=\"violation\">true</data>\n  </node>"
                );
            } else {
                let _ = writeln!(doc, "  <node id=\"N{node}\"/>");
            }
            let _ = writeln!(doc, "  <edge source=\"N{}\" target=\"N{node}\">", node - 1);
            let _ = writeln!(
                doc,
                "   <data key=\"enterFunction\">{}</data>",
                escape(&step.function)
            );
            if let Some(line) = step.line {
                let _ = writeln!(doc, "   <data key=\"startline\">{line}</data>");
            }
            if let Some(file) = &step.file {
                let _ = writeln!(doc, "   <data key=\"originfile\">{}</data>", escape(file));
            }
            if let Some(note) = &step.note {
                let _ = writeln!(doc, "   <data key=\"note\">{}</data>", escape(note));
            }
            doc.push_str("  </edge>\n");
        }
        if steps.is_empty() && request.kind == WitnessKind::Violation {
            // No trace: the violation is reachable from the entry, nothing more
            doc.push_str("  <node id=\"N1\">\n   <data key=\"violation\">true</data>\n  </node>\n");
            doc.push_str("  <edge source=\"N0\" target=\"N1\"/>\n");
        }
        doc.push_str(" </graph>\n</graphml>\n");
        Ok(doc)
    }
}

impl WitnessWriter for GraphmlWitnessWriter {
    fn write(&self, request: &WitnessRequest) -> Result<(), WitnessError> {
        let doc = self.render(request)?;
        std::fs::write(&request.destination, doc).map_err(|source| WitnessError::Write {
            path: request.destination.clone(),
            source,
        })
    }
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, kind: WitnessKind, trace: Option<ExecutionTrace>) -> WitnessRequest {
        let source = dir.join("test.c");
        std::fs::write(&source, "int main(void) { return 0; }\n").unwrap();
        WitnessRequest {
            kind,
            property: Property::default(),
            sources: vec![source.clone()],
            is_32bit: false,
            trace,
            destination: WitnessRequest::default_destination(&[source], dir),
        }
    }

    #[test]
    fn default_destination_uses_first_source_stem() {
        let dest = WitnessRequest::default_destination(
            &[PathBuf::from("/src/prog.c"), PathBuf::from("/src/lib.c")],
            Path::new("/out"),
        );
        assert_eq!(dest, PathBuf::from("/out/prog.graphml"));
    }

    #[test]
    fn violation_witness_contains_trace_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let trace = ExecutionTrace {
            steps: vec![
                TraceStep {
                    function: "main".into(),
                    file: Some("test.c".into()),
                    line: Some(10),
                    note: None,
                },
                TraceStep {
                    function: "reach_error".into(),
                    file: Some("test.c".into()),
                    line: Some(3),
                    note: Some("a < b && c".into()),
                },
            ],
        };
        let request = request(dir.path(), WitnessKind::Violation, Some(trace));
        GraphmlWitnessWriter::new().write(&request).unwrap();

        let doc = std::fs::read_to_string(dir.path().join("test.graphml")).unwrap();
        assert!(doc.contains("violation_witness"));
        assert!(doc.contains("<data key=\"startline\">3</data>"));
        assert!(doc.contains("a &lt; b &amp;&amp; c"));
        assert!(doc.contains("<data key=\"violation\">true</data>"));
        assert!(doc.contains("G ! call(reach_error())"));
        assert_eq!(doc.matches("<edge ").count(), 2);

        let hash = sha256_hex(b"int main(void) { return 0; }\n");
        assert_eq!(hash.len(), 64);
        assert!(doc.contains(&hash));
    }

    #[test]
    fn correctness_witness_has_no_edges() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(dir.path(), WitnessKind::Correctness, None);
        let doc = GraphmlWitnessWriter::new().render(&request).unwrap();
        assert!(doc.contains("correctness_witness"));
        assert!(!doc.contains("<edge "));
    }

    #[test]
    fn violation_witness_without_trace_marks_violation_node() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(dir.path(), WitnessKind::Violation, None);
        let doc = GraphmlWitnessWriter::new().render(&request).unwrap();
        assert!(doc.contains("violation_witness"));
        assert!(doc.contains("<data key=\"entry\">true</data>"));
        assert!(doc.contains("<data key=\"violation\">true</data>"));
        assert_eq!(doc.matches("<edge ").count(), 1);
        assert!(!doc.contains("enterFunction\">"));
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = request(dir.path(), WitnessKind::Violation, None);
        request.sources = vec![dir.path().join("gone.c")];
        assert!(matches!(
            GraphmlWitnessWriter::new().write(&request),
            Err(WitnessError::Source { .. })
        ));
    }
}
