//! Minimal XML tree-to-text serialization for the FLAME model files.
//!
//! This is a pure helper: it builds an element tree in memory and renders it
//! with two-space indentation. Attribute and text values are escaped.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlContent {
    Text(String),
    Elems(Vec<XmlElem>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElem {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub content: XmlContent,
}

impl XmlElem {
    pub fn new(name: &str, children: Vec<XmlElem>) -> Self {
        Self {
            name: name.to_owned(),
            attrs: vec![],
            content: XmlContent::Elems(children),
        }
    }

    pub fn text(name: &str, text: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            attrs: vec![],
            content: XmlContent::Text(text.into()),
        }
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attrs.push((name.to_owned(), value.to_owned()));
    }

    pub fn push(&mut self, child: XmlElem) {
        if let XmlContent::Elems(children) = &mut self.content {
            children.push(child);
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct XmlWriter {
    out: String,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serialize(mut self, root: &XmlElem) -> String {
        self.out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        self.write_elem(root, 0);
        self.out
    }

    fn write_elem(&mut self, elem: &XmlElem, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }

        self.out.push('<');
        self.out.push_str(&elem.name);
        for (name, value) in &elem.attrs {
            self.out.push(' ');
            self.out.push_str(name);
            self.out.push_str("=\"");
            self.out.push_str(&escape(value));
            self.out.push('"');
        }

        match &elem.content {
            XmlContent::Text(text) => {
                self.out.push('>');
                self.out.push_str(&escape(text));
                self.out.push_str("</");
                self.out.push_str(&elem.name);
                self.out.push_str(">\n");
            }
            XmlContent::Elems(children) if children.is_empty() => {
                self.out.push_str("/>\n");
            }
            XmlContent::Elems(children) => {
                self.out.push_str(">\n");
                for child in children {
                    self.write_elem(child, depth + 1);
                }
                for _ in 0..depth {
                    self.out.push_str("  ");
                }
                self.out.push_str("</");
                self.out.push_str(&elem.name);
                self.out.push_str(">\n");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_nested_elements() {
        let mut root = XmlElem::new(
            "model",
            vec![XmlElem::new(
                "agents",
                vec![XmlElem::text("name", "Cell")],
            )],
        );
        root.set_attr("xmlns", "http://example.org/schema");

        let xml = XmlWriter::new().serialize(&root);
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <model xmlns=\"http://example.org/schema\">\n  \
               <agents>\n    \
                 <name>Cell</name>\n  \
               </agents>\n\
             </model>\n"
        );
    }

    #[test]
    fn test_escapes_text() {
        let xml = XmlWriter::new().serialize(&XmlElem::text("a", "x < \"y\" & z"));
        assert!(xml.contains("x &lt; &quot;y&quot; &amp; z"));
    }
}
