// Expands `${name}` references between alias table entries. References are
// resolved transitively and the whole table is expanded once, when it is loaded.
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("property {key} references unknown variable {variable}")]
    UnknownVariable { key: String, variable: String },
    #[error("property {key} contains a reference cycle")]
    Cycle { key: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    InProgress,
    Done,
}

struct Expander<'a> {
    raw: &'a HashMap<String, String>,
    expanded: HashMap<String, String>,
    state: HashMap<&'a str, State>,
}

pub fn interpolate(
    raw: &HashMap<String, String>,
) -> Result<HashMap<String, String>, InterpolationError> {
    let mut expander = Expander {
        raw,
        expanded: HashMap::with_capacity(raw.len()),
        state: HashMap::with_capacity(raw.len()),
    };

    for key in raw.keys() {
        expander.expand_key(key)?;
    }

    Ok(expander.expanded)
}

impl<'a> Expander<'a> {
    fn expand_key(&mut self, key: &'a str) -> Result<(), InterpolationError> {
        match self.state.get(key) {
            Some(State::Done) => return Ok(()),
            Some(State::InProgress) => {
                return Err(InterpolationError::Cycle {
                    key: key.to_string(),
                });
            }
            None => {}
        }

        let raw = self.raw;
        let Some(value) = raw.get(key) else {
            return Ok(());
        };

        self.state.insert(key, State::InProgress);

        let mut out = String::with_capacity(value.len());
        let mut rest = value.as_str();
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            // An unterminated reference is kept as literal text.
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let variable = &after[..end];
            let Some((raw_key, _)) = raw.get_key_value(variable) else {
                return Err(InterpolationError::UnknownVariable {
                    key: key.to_string(),
                    variable: variable.to_string(),
                });
            };
            self.expand_key(raw_key)?;
            if let Some(replacement) = self.expanded.get(variable) {
                out.push_str(replacement);
            }

            rest = &after[end + 1..];
        }
        out.push_str(rest);

        self.state.insert(key, State::Done);
        self.expanded.insert(key.to_string(), out);
        Ok(())
    }
}
