use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub const DEFAULT_GRID_ROWS: u32 = 10;
pub const DEFAULT_GRID_COLS: u32 = 10;
pub const DEFAULT_SPEED: u32 = 3;
pub const WARNING_DURATION_SECS: u64 = 1;
pub const HIT_SWEEP_INTERVAL_SECS: u64 = 1;
pub const REGEN_INTERVAL_SECS: u64 = 6;
pub const DEFAULT_TIMING_SECS: f64 = 0.0;
pub const DEFAULT_SQUARE_DURATION_SECS: f64 = 3.0;

/// Token colors handed out to players in join order.
pub const PLAYER_COLORS: [&str; 8] = [
    "#3B82F6", "#10B981", "#F59E0B", "#EF4444", "#8B5CF6", "#EC4899", "#14B8A6", "#F97316",
];

/// Connection-scoped identity. Players are keyed by the identity of the
/// connection that joined them, and the DM slot stores one as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Events sent by browser clients. Each frame is a JSON object of the form
/// `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    CreateGame {
        rows: u32,
        cols: u32,
    },
    JoinGame {
        name: String,
    },
    MovePlayer {
        row: u32,
        col: u32,
    },
    UpdateTokenImage {
        #[serde(rename = "imageData")]
        image_data: String,
    },
    UpdateSpeed {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        speed: u32,
    },
    UpdateGridSize {
        rows: u32,
        cols: u32,
    },
    UpdateBackground {
        #[serde(rename = "imageData")]
        image_data: String,
    },
    SavePattern(Pattern),
    LaunchPattern(Pattern),
    DeletePattern {
        index: i64,
    },
}

impl ClientEvent {
    /// Wire name of the event, used in logs and rejection notices.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CreateGame { .. } => "createGame",
            ClientEvent::JoinGame { .. } => "joinGame",
            ClientEvent::MovePlayer { .. } => "movePlayer",
            ClientEvent::UpdateTokenImage { .. } => "updateTokenImage",
            ClientEvent::UpdateSpeed { .. } => "updateSpeed",
            ClientEvent::UpdateGridSize { .. } => "updateGridSize",
            ClientEvent::UpdateBackground { .. } => "updateBackground",
            ClientEvent::SavePattern(_) => "savePattern",
            ClientEvent::LaunchPattern(_) => "launchPattern",
            ClientEvent::DeletePattern { .. } => "deletePattern",
        }
    }
}

/// Events pushed by the server, using the same envelope as [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    DmStatus(bool),
    PlayerId(ConnectionId),
    GameState(Box<GameSnapshot>),
    /// Only sent when the server runs with rejection acknowledgements enabled.
    CommandRejected { event: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: ConnectionId,
    pub name: String,
    pub row: u32,
    pub col: u32,
    pub color: String,
    pub speed: u32,
    pub speed_remaining: u32,
    pub hits: u32,
    pub token_image: Option<String>,
}

impl Player {
    pub fn new(id: ConnectionId, name: String, row: u32, col: u32, color: &str) -> Self {
        Self {
            id,
            name,
            row,
            col,
            color: color.to_string(),
            speed: DEFAULT_SPEED,
            speed_remaining: DEFAULT_SPEED,
            hits: 0,
            token_image: None,
        }
    }

    pub fn position(&self) -> (u32, u32) {
        (self.row, self.col)
    }

    pub fn is_at(&self, row: u32, col: u32) -> bool {
        self.row == row && self.col == col
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSquare {
    pub row: u32,
    pub col: u32,
    /// Seconds from launch until the square enters its warning phase.
    #[serde(default = "default_timing", deserialize_with = "lenient_timing")]
    pub timing: f64,
    /// Seconds the square stays in its damage phase.
    #[serde(default = "default_duration", deserialize_with = "lenient_duration")]
    pub duration: f64,
}

impl PatternSquare {
    pub fn new(row: u32, col: u32, timing: f64, duration: f64) -> Self {
        Self {
            row,
            col,
            timing,
            duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub squares: Vec<PatternSquare>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Warning,
    Damage,
}

/// One in-flight activation of a pattern square.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSquare {
    pub id: u64,
    pub row: u32,
    pub col: u32,
    pub phase: Phase,
}

/// Full session state as broadcast to every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub grid_rows: u32,
    pub grid_cols: u32,
    #[serde(with = "players_by_id")]
    pub players: Vec<Player>,
    pub dm: Option<ConnectionId>,
    pub saved_patterns: Vec<Pattern>,
    pub active_squares: Vec<ActiveSquare>,
    pub background_image: Option<String>,
}

/// Grid distance in cells when only orthogonal steps are allowed.
pub fn manhattan_distance(from: (u32, u32), to: (u32, u32)) -> u32 {
    from.0.abs_diff(to.0) + from.1.abs_diff(to.1)
}

/// Reads a seconds value the way browser clients send it: a JSON number or a
/// numeric string. Anything else, negative, or non-finite yields `None`.
pub fn seconds_from_value(value: Option<&Value>) -> Option<f64> {
    let seconds = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

fn default_timing() -> f64 {
    DEFAULT_TIMING_SECS
}

fn default_duration() -> f64 {
    DEFAULT_SQUARE_DURATION_SECS
}

fn lenient_timing<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(seconds_from_value(value.as_ref()).unwrap_or(DEFAULT_TIMING_SECS))
}

fn lenient_duration<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(seconds_from_value(value.as_ref()).unwrap_or(DEFAULT_SQUARE_DURATION_SECS))
}

/// Players travel as a JSON object keyed by id, in join order.
mod players_by_id {
    use super::{ConnectionId, Player};
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S>(players: &Vec<Player>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(players.len()))?;
        for player in players {
            map.serialize_entry(&player.id, player)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Player>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PlayersVisitor;

        impl<'de> Visitor<'de> for PlayersVisitor {
            type Value = Vec<Player>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of player id to player")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut players = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((_, player)) = access.next_entry::<ConnectionId, Player>()? {
                    players.push(player);
                }
                Ok(players)
            }
        }

        deserializer.deserialize_map(PlayersVisitor)
    }
}
