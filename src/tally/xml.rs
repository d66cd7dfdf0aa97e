//! vMix XML status document parsing.
//!
//! Only the parts the tally bridge needs are read: `<active>`, `<preview>`
//! and every `<input number="" title="" type="">` element.

use log::warn;
use roxmltree::{Document, Node};

use super::state::{InputDescriptor, TallyState};
use super::TallyError;

/// Parse a vMix `/api` response into a [`TallyState`].
pub fn parse_state(xml: &str) -> Result<TallyState, TallyError> {
    let doc = Document::parse(xml).map_err(|e| TallyError::Parse(e.to_string()))?;

    let program = required_number(&doc, "active")?;
    let preview = required_number(&doc, "preview")?;

    let inputs = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "input")
        .filter_map(parse_input);

    Ok(TallyState::new(program, preview, inputs))
}

fn required_number(doc: &Document<'_>, tag: &str) -> Result<u32, TallyError> {
    let text = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
        .and_then(|n| n.text())
        .ok_or_else(|| TallyError::Parse(format!("missing <{}> element", tag)))?;

    text.trim()
        .parse()
        .map_err(|_| TallyError::Parse(format!("<{}> is not an input number: {:?}", tag, text)))
}

fn parse_input(node: Node<'_, '_>) -> Option<InputDescriptor> {
    let number = match node.attribute("number").map(|s| s.trim().parse::<u32>()) {
        Some(Ok(n)) => n,
        other => {
            warn!("[Tally] Skipping <input> with bad number attribute: {:?}", other);
            return None;
        }
    };

    let name = node
        .attribute("title")
        .map(str::to_string)
        .unwrap_or_else(|| format!("Input {}", number));
    let input_type = node.attribute("type").unwrap_or("Unknown").to_string();

    Some(InputDescriptor::new(number, name, input_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::state::TallyTag;

    const SAMPLE: &str = r#"<vmix>
  <version>27.0.0.49</version>
  <edition>4K</edition>
  <inputs>
    <input key="a1" number="3" type="Capture" title="Cam A" state="Running">Cam A</input>
    <input key="b2" number="5" type="Capture" title="Cam B" state="Running">Cam B</input>
    <input key="c3" number="7" type="GT" title="Graphics" state="Paused">Graphics</input>
  </inputs>
  <overlays>
    <overlay number="1"/>
  </overlays>
  <preview>5</preview>
  <active>3</active>
</vmix>"#;

    #[test]
    fn test_parse_sample_document() {
        let state = parse_state(SAMPLE).unwrap();
        assert_eq!(state.buses(), (3, 5));

        let tally: Vec<_> = state.tally_map().into_iter().collect();
        assert_eq!(
            tally,
            vec![(3, TallyTag::Pgm), (5, TallyTag::Pvw), (7, TallyTag::Off)]
        );

        let names: Vec<_> = state.input_names().into_iter().collect();
        assert_eq!(
            names,
            vec![
                (3, "Cam A".to_string()),
                (5, "Cam B".to_string()),
                (7, "Graphics".to_string())
            ]
        );
        assert_eq!(state.inputs[&7].input_type, "GT");
    }

    #[test]
    fn test_missing_attributes_use_defaults() {
        let xml = r#"<vmix><inputs><input number="2"/></inputs><active>2</active><preview>0</preview></vmix>"#;
        let state = parse_state(xml).unwrap();
        assert_eq!(state.inputs[&2].name, "Input 2");
        assert_eq!(state.inputs[&2].input_type, "Unknown");
    }

    #[test]
    fn test_input_without_number_is_skipped() {
        let xml = r#"<vmix><inputs><input title="x"/><input number="1" title="y"/></inputs><active>1</active><preview>1</preview></vmix>"#;
        let state = parse_state(xml).unwrap();
        assert_eq!(state.inputs.len(), 1);
    }

    #[test]
    fn test_malformed_documents_fail() {
        assert!(matches!(parse_state("<vmix><active>"), Err(TallyError::Parse(_))));
        assert!(matches!(
            parse_state("<vmix><preview>1</preview></vmix>"),
            Err(TallyError::Parse(_))
        ));
        assert!(matches!(
            parse_state("<vmix><active>cam</active><preview>1</preview></vmix>"),
            Err(TallyError::Parse(_))
        ));
    }
}
