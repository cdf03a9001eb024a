//! Maccor procedure parser
//!
//! Reads `MaccorTestProcedure > ProcSteps > TestStep[]` documents into a
//! [`Procedure`]. Only structure is validated here; step semantics are the
//! converter's concern.

use std::path::Path;

use roxmltree::{Document, Node};
use thiserror::Error;

use super::schema::{EndCondition, Procedure, ProcedureStep, ReportTrigger, SafetyLimit};
use super::ProcedureAdapter;

const ROOT_TAG: &str = "MaccorTestProcedure";

#[derive(Debug, Error)]
pub enum MaccorParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Expected root element '{expected}', found '{found}'")]
    UnexpectedRoot { expected: &'static str, found: String },

    #[error("Missing element: {0}")]
    MissingElement(&'static str),
}

impl From<roxmltree::Error> for MaccorParseError {
    fn from(e: roxmltree::Error) -> Self {
        MaccorParseError::Xml(e.to_string())
    }
}

pub struct MaccorParser;

impl MaccorParser {
    pub fn parse_procedure(path: &Path) -> Result<Procedure, MaccorParseError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Procedure, MaccorParseError> {
        let doc = Document::parse(strip_bom(content))?;
        let root = doc.root_element();
        if root.tag_name().name() != ROOT_TAG {
            return Err(MaccorParseError::UnexpectedRoot {
                expected: ROOT_TAG,
                found: root.tag_name().name().to_string(),
            });
        }

        let proc_steps = child(root, "ProcSteps").ok_or(MaccorParseError::MissingElement("ProcSteps"))?;
        let steps = proc_steps
            .children()
            .filter(|n| n.has_tag_name("TestStep"))
            .map(parse_test_step)
            .collect();

        Ok(Procedure { steps })
    }
}

/// Adapter entry point for Maccor `.000` / `.xml` procedures.
pub struct MaccorAdapter;

impl ProcedureAdapter for MaccorAdapter {
    fn format_name(&self) -> &'static str {
        "Maccor procedure"
    }

    fn supported_extensions(&self) -> &[&str] {
        &["000", "xml"]
    }

    fn parse_str(&self, content: &str) -> Result<Procedure, MaccorParseError> {
        MaccorParser::parse_str(content)
    }
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|c| c.has_tag_name(name))
}

/// Text of the named child element, untrimmed. Missing or empty elements read as "".
fn child_text(node: Node, name: &str) -> String {
    child(node, name)
        .and_then(|c| c.text())
        .unwrap_or("")
        .to_string()
}

fn parse_test_step(node: Node) -> ProcedureStep {
    let ends = child(node, "Ends")
        .map(|ends| {
            ends.children()
                .filter(|n| n.has_tag_name("EndEntry"))
                .map(|entry| EndCondition {
                    end_type: child_text(entry, "EndType"),
                    special_type: child_text(entry, "SpecialType"),
                    oper: child_text(entry, "Oper"),
                    step: child_text(entry, "Step"),
                    value: child_text(entry, "Value"),
                })
                .collect()
        })
        .unwrap_or_default();

    let reports = child(node, "Reports")
        .map(|reports| {
            reports
                .children()
                .filter(|n| n.has_tag_name("ReportEntry"))
                .map(|entry| ReportTrigger {
                    report_type: child_text(entry, "ReportType"),
                    value: child_text(entry, "Value"),
                })
                .collect()
        })
        .unwrap_or_default();

    let safety_limits = child(node, "Limits")
        .map(|limits| {
            limits
                .children()
                .filter(|n| n.is_element())
                .map(|l| SafetyLimit {
                    name: l.tag_name().name().to_string(),
                    text: l
                        .descendants()
                        .filter(|d| d.is_text())
                        .filter_map(|d| d.text())
                        .collect::<Vec<_>>()
                        .join(" ")
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" "),
                })
                .collect()
        })
        .unwrap_or_default();

    ProcedureStep {
        step_type: child_text(node, "StepType"),
        step_mode: child_text(node, "StepMode"),
        step_value: child_text(node, "StepValue"),
        safety_limits,
        ends,
        reports,
        range: child_text(node, "Range"),
        options: [
            child_text(node, "Option1"),
            child_text(node, "Option2"),
            child_text(node, "Option3"),
        ],
        note: child_text(node, "StepNote"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_STEPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<?maccor-application progid="Maccor Procedure File"?>
<MaccorTestProcedure>
  <header><BuildTestVersion><major>1</major></BuildTestVersion></header>
  <ProcSteps>
    <TestStep>
      <StepType>  Rest  </StepType>
      <StepMode>        </StepMode>
      <StepValue></StepValue>
      <Limits/>
      <Ends>
        <EndEntry>
          <EndType>StepTime</EndType>
          <SpecialType> </SpecialType>
          <Oper> = </Oper>
          <Step>002</Step>
          <Value>00:10:00</Value>
        </EndEntry>
      </Ends>
      <Reports>
        <ReportEntry>
          <ReportType>StepTime</ReportType>
          <Value>::1</Value>
        </ReportEntry>
      </Reports>
      <Range>A</Range>
      <Option1>N</Option1>
      <Option2>N</Option2>
      <Option3>N</Option3>
      <StepNote>settle</StepNote>
    </TestStep>
    <TestStep>
      <StepType>End</StepType>
      <StepMode></StepMode>
      <StepValue></StepValue>
      <Limits/>
      <Ends/>
      <Reports/>
      <Range></Range>
      <Option1></Option1>
      <Option2></Option2>
      <Option3></Option3>
      <StepNote></StepNote>
    </TestStep>
  </ProcSteps>
</MaccorTestProcedure>"#;

    #[test]
    fn test_parse_two_steps() {
        let procedure = MaccorParser::parse_str(TWO_STEPS).unwrap();
        assert_eq!(procedure.len(), 2);

        let rest = procedure.step(1).unwrap();
        assert_eq!(rest.step_type, "  Rest  ");
        assert_eq!(rest.ends.len(), 1);
        assert_eq!(rest.ends[0].oper, " = ");
        assert_eq!(rest.ends[0].step, "002");
        assert_eq!(rest.reports[0].value, "::1");
        assert_eq!(rest.options[0], "N");
        assert_eq!(rest.note, "settle");

        let end = procedure.step(2).unwrap();
        assert_eq!(end.step_type, "End");
        assert!(end.ends.is_empty());
        assert!(procedure.step(3).is_none());
        assert!(procedure.step(0).is_none());
    }

    #[test]
    fn test_bom_is_ignored() {
        let with_bom = format!("\u{feff}{}", TWO_STEPS);
        assert_eq!(MaccorParser::parse_str(&with_bom).unwrap().len(), 2);
    }

    #[test]
    fn test_wrong_root() {
        let err = MaccorParser::parse_str("<Other/>").unwrap_err();
        assert!(matches!(err, MaccorParseError::UnexpectedRoot { .. }));
    }

    #[test]
    fn test_missing_proc_steps() {
        let err = MaccorParser::parse_str("<MaccorTestProcedure/>").unwrap_err();
        assert!(matches!(err, MaccorParseError::MissingElement("ProcSteps")));
    }

    #[test]
    fn test_malformed_xml() {
        let err = MaccorParser::parse_str("<MaccorTestProcedure><ProcSteps>").unwrap_err();
        assert!(matches!(err, MaccorParseError::Xml(_)));
    }

    #[test]
    fn test_safety_limits_are_collected() {
        let xml = r#"<MaccorTestProcedure><ProcSteps><TestStep>
            <StepType>Charge</StepType>
            <Limits><Voltage> 4.5 </Voltage></Limits>
        </TestStep></ProcSteps></MaccorTestProcedure>"#;
        let procedure = MaccorParser::parse_str(xml).unwrap();
        let step = procedure.step(1).unwrap();
        assert_eq!(step.safety_limits.len(), 1);
        assert_eq!(step.safety_limits[0].name, "Voltage");
        assert_eq!(step.safety_limits[0].text, "4.5");
        assert_eq!(step.step_mode, "");
    }
}
