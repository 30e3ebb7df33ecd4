//! Line commands for the headless `join` console.

use tabula_core::ShapeKey;

pub const HELP: &str = "\
commands:
  rect | r                 add a rectangle
  circle | c               add a circle
  delete | d               delete the last added shape
  move <key> <left> <top>  move a shape
  cursor <x> <y>           move your cursor
  list | ls                list shapes
  peers                    list other peers
  help | ?                 this text
  quit | q                 leave the room";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Rect,
    Circle,
    Delete,
    Move { key: ShapeKey, left: f64, top: f64 },
    Cursor { x: f64, y: f64 },
    List,
    Peers,
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Input>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let input = match (head, args.as_slice()) {
        ("rect" | "r", []) => Input::Rect,
        ("circle" | "c", []) => Input::Circle,
        ("delete" | "d", []) => Input::Delete,
        ("move" | "m", [key, left, top]) => Input::Move {
            key: ShapeKey::new(*key),
            left: number(left)?,
            top: number(top)?,
        },
        ("cursor", [x, y]) => Input::Cursor {
            x: number(x)?,
            y: number(y)?,
        },
        ("list" | "ls", []) => Input::List,
        ("peers", []) => Input::Peers,
        ("help" | "?", []) => Input::Help,
        ("quit" | "q" | "exit", []) => Input::Quit,
        ("move" | "m" | "cursor", _) => return Err(format!("wrong arguments for `{head}`")),
        _ => return Err(format!("unknown command `{head}`, try `help`")),
    };
    Ok(Some(input))
}

fn number(word: &str) -> Result<f64, String> {
    word.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| format!("not a number: {word}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse("rect"), Ok(Some(Input::Rect)));
        assert_eq!(parse("  c  "), Ok(Some(Input::Circle)));
        assert_eq!(parse("d"), Ok(Some(Input::Delete)));
        assert_eq!(parse("ls"), Ok(Some(Input::List)));
        assert_eq!(parse("q"), Ok(Some(Input::Quit)));
        assert_eq!(parse(""), Ok(None));
    }

    #[test]
    fn test_parse_move() {
        assert_eq!(
            parse("move abc-1 50 60.5"),
            Ok(Some(Input::Move {
                key: ShapeKey::new("abc-1"),
                left: 50.0,
                top: 60.5,
            }))
        );
        assert!(parse("move abc-1 50").is_err());
        assert!(parse("move abc-1 x 60").is_err());
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse("cursor 100 200"), Ok(Some(Input::Cursor { x: 100.0, y: 200.0 })));
        assert!(parse("cursor NaN 1").is_err());
    }

    #[test]
    fn test_unknown_command() {
        let err = parse("draw triangle").unwrap_err();
        assert!(err.contains("draw"));
    }
}
