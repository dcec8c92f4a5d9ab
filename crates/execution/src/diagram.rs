use std::fmt;

/// Textual description of a node and its downstream chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagram {
    pub details: String,
    pub child: Option<Box<Diagram>>,
}

impl Diagram {
    pub fn new(details: impl Into<String>, child: Option<Diagram>) -> Self {
        Self {
            details: details.into(),
            child: child.map(Box::new),
        }
    }

    /// Node descriptions from this node to the end of the chain.
    pub fn steps(&self) -> Vec<&str> {
        let mut out = vec![self.details.as_str()];
        let mut cur = self.child.as_deref();
        while let Some(d) = cur {
            out.push(d.details.as_str());
            cur = d.child.as_deref();
        }
        out
    }
}

impl fmt::Display for Diagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.steps().join(" -> "))
    }
}
