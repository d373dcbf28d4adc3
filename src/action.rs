use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

pub const BUTTON_BACK: &str = "back";
pub const BUTTON_HOME: &str = "home";

pub type Point = [i64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn from_drag(touch: Point, lift: Point) -> Option<Self> {
        // f64 so far off-screen points cannot overflow
        let dx = lift[0] as f64 - touch[0] as f64;
        let dy = lift[1] as f64 - touch[1] as f64;
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        let d = if dx.abs() > dy.abs() {
            if dx > 0.0 {
                Direction::Right
            } else {
                Direction::Left
            }
        } else if dy > 0.0 {
            Direction::Down
        } else {
            Direction::Up
        };
        Some(d)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "left" => Some(Direction::Left),
            "right" => Some(Direction::Right),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i64; 4]", into = "[i64; 4]")]
pub struct BBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl BBox {
    pub const fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    fn from_value(v: &Value) -> Option<Self> {
        let arr = v.as_array()?;
        if arr.len() != 4 {
            return None;
        }
        let mut out = [0i64; 4];
        for (slot, item) in out.iter_mut().zip(arr) {
            *slot = as_int(item)?;
        }
        Some(out.into())
    }
}

impl From<[i64; 4]> for BBox {
    fn from(v: [i64; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [i64; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Click { x: i64, y: i64 },
    LongPress { x: i64, y: i64 },
    Swipe { direction: Direction },
    SwipeXY { touch: Point, lift: Point },
    Type { text: String },
    Answer { text: String },
    Open { app: String },
    SystemButton { button: String },
    Wait,
    Complete,
    Status { status: String },
    Custom { action_type: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_type: String,
    #[serde(default)]
    pub action_parameter: Value,
}

impl Action {
    pub fn back() -> Self {
        Action::SystemButton { button: BUTTON_BACK.to_string() }
    }

    pub fn home() -> Self {
        Action::SystemButton { button: BUTTON_HOME.to_string() }
    }

    pub fn is_back(&self) -> bool {
        matches!(self, Action::SystemButton { button } if button.eq_ignore_ascii_case(BUTTON_BACK))
    }

    pub fn is_home(&self) -> bool {
        matches!(self, Action::SystemButton { button } if button.eq_ignore_ascii_case(BUTTON_HOME))
    }

    pub fn action_type(&self) -> &str {
        match self {
            Action::Click { .. } => "click",
            Action::LongPress { .. } => "long_press",
            Action::Swipe { .. } | Action::SwipeXY { .. } => "swipe",
            Action::Type { .. } => "type",
            Action::Answer { .. } => "answer",
            Action::Open { .. } => "open",
            Action::SystemButton { .. } => "system_button",
            Action::Wait => "wait",
            Action::Complete => "complete",
            Action::Status { .. } => "status",
            Action::Custom { action_type, .. } => action_type,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            Action::Swipe { direction } => Some(*direction),
            Action::SwipeXY { touch, lift } => Direction::from_drag(*touch, *lift),
            _ => None,
        }
    }

    pub fn to_record(&self) -> ActionRecord {
        let action_parameter = match self {
            Action::Click { x, y } | Action::LongPress { x, y } => json!({ "x": x, "y": y }),
            Action::Swipe { direction } => json!({ "direction": direction.as_str() }),
            Action::SwipeXY { touch, lift } => json!({ "start": touch, "lift": lift }),
            Action::Type { text } | Action::Answer { text } => json!({ "text": text }),
            Action::Open { app } => json!({ "text": app }),
            Action::SystemButton { button } => json!({ "text": button }),
            Action::Wait | Action::Complete => json!({}),
            Action::Status { status } => json!({ "status": status }),
            Action::Custom { value, .. } => value.clone(),
        };
        ActionRecord { action_type: self.action_type().to_string(), action_parameter }
    }

    // Malformed parameters degrade to Custom so one bad edge never fails a load.
    pub fn from_record(record: &ActionRecord) -> Self {
        let p = &record.action_parameter;
        let kind = record.action_type.to_lowercase();
        let decoded = match kind.as_str() {
            "click" => int_pair(p, "x", "y").map(|(x, y)| Action::Click { x, y }),
            "long_press" => int_pair(p, "x", "y").map(|(x, y)| Action::LongPress { x, y }),
            "swipe" => match p.get("direction").and_then(|d| d.as_str()) {
                Some(d) => Direction::parse(d).map(|direction| Action::Swipe { direction }),
                None => point(p.get("start"))
                    .zip(point(p.get("lift")))
                    .map(|(touch, lift)| Action::SwipeXY { touch, lift }),
            },
            "type" => string(p, &["text"]).map(|text| Action::Type { text }),
            "answer" => string(p, &["text"]).map(|text| Action::Answer { text }),
            "open" => string(p, &["text", "app"]).map(|app| Action::Open { app }),
            "system_button" => string(p, &["text", "button"]).map(|button| Action::SystemButton { button }),
            "wait" => Some(Action::Wait),
            "complete" => Some(Action::Complete),
            "status" => string(p, &["status", "goal_status"]).map(|status| Action::Status { status }),
            _ => None,
        };
        match decoded {
            Some(a) => a,
            None => {
                if is_known_type(&kind) {
                    warn!(action_type = %record.action_type, parameter = %p, "malformed action parameter, keeping raw value");
                }
                Action::Custom { action_type: record.action_type.clone(), value: p.clone() }
            }
        }
    }

    pub fn from_raw(raw: &Value) -> Self {
        let owned;
        let v = match raw {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed) => {
                    owned = parsed;
                    &owned
                }
                Err(_) => {
                    return Action::Custom { action_type: "custom".into(), value: raw.clone() };
                }
            },
            other => other,
        };

        let kind = v
            .get("action_type")
            .and_then(|x| x.as_str())
            .unwrap_or("unknown")
            .to_lowercase();
        let decoded = match kind.as_str() {
            "click" => int_pair(v, "x", "y").map(|(x, y)| Action::Click { x, y }),
            "long_press" => int_pair(v, "x", "y").map(|(x, y)| Action::LongPress { x, y }),
            "swipe" => match v.get("direction").and_then(|d| d.as_str()) {
                Some(d) => Direction::parse(d).map(|direction| Action::Swipe { direction }),
                None => point(v.get("touch_xy"))
                    .zip(point(v.get("lift_xy")))
                    .map(|(touch, lift)| Action::SwipeXY { touch, lift }),
            },
            "type" | "input_text" | "input" => string(v, &["text"]).map(|text| Action::Type { text }),
            "answer" => string(v, &["text"]).map(|text| Action::Answer { text }),
            "open" | "open_app" => string(v, &["app", "app_name", "text"]).map(|app| Action::Open { app }),
            "system_button" => string(v, &["button", "text"]).map(|button| Action::SystemButton { button }),
            "navigate_back" => Some(Action::back()),
            "navigate_home" => Some(Action::home()),
            "wait" => Some(Action::Wait),
            "complete" => Some(Action::Complete),
            "status" => string(v, &["goal_status", "status"]).map(|status| Action::Status { status }),
            _ => None,
        };
        decoded.unwrap_or_else(|| Action::Custom { action_type: kind, value: v.clone() })
    }
}

pub fn raw_bbox(raw: &Value) -> Option<BBox> {
    match raw {
        Value::String(s) => serde_json::from_str::<Value>(s).ok().and_then(|v| raw_bbox(&v)),
        v => v.get("bbox").and_then(BBox::from_value),
    }
}

fn is_known_type(kind: &str) -> bool {
    matches!(
        kind,
        "click" | "long_press" | "swipe" | "type" | "answer" | "open" | "system_button" | "wait" | "complete" | "status"
    )
}

fn as_int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
}

fn int_pair(v: &Value, a: &str, b: &str) -> Option<(i64, i64)> {
    Some((as_int(v.get(a)?)?, as_int(v.get(b)?)?))
}

fn point(v: Option<&Value>) -> Option<Point> {
    let arr = v?.as_array()?;
    match arr.as_slice() {
        [x, y] => Some([as_int(x)?, as_int(y)?]),
        _ => None,
    }
}

fn string(v: &Value, keys: &[&str]) -> Option<String> {
    let obj: &Map<String, Value> = v.as_object()?;
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|x| x.as_str()))
        .map(|s| s.to_string())
}
