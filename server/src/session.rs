//! Authoritative session store.
//!
//! Holds the one shared game session: grid size, player roster, DM slot,
//! saved patterns, in-flight attack squares and the background image. Every
//! rule about who may change what lives here, so a rejected command never
//! leaves a partial mutation behind.

use crate::error::CommandError;
use log::{info, warn};
use shared::{
    manhattan_distance, ActiveSquare, ConnectionId, GameSnapshot, Pattern, Player,
    DEFAULT_GRID_COLS, DEFAULT_GRID_ROWS, PLAYER_COLORS,
};

/// Upper bounds applied to DM-provided grid dimensions.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_grid_size: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { max_grid_size: 100 }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    grid_rows: u32,
    grid_cols: u32,
    /// Join order is significant, so the roster is a vector rather than a map.
    players: Vec<Player>,
    dm: Option<ConnectionId>,
    saved_patterns: Vec<Pattern>,
    active_squares: Vec<ActiveSquare>,
    background_image: Option<String>,
    /// Monotonic; never rewound when players leave.
    color_index: usize,
    limits: SessionLimits,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

impl Session {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            grid_rows: DEFAULT_GRID_ROWS,
            grid_cols: DEFAULT_GRID_COLS,
            players: Vec::new(),
            dm: None,
            saved_patterns: Vec::new(),
            active_squares: Vec::new(),
            background_image: None,
            color_index: 0,
            limits,
        }
    }

    pub fn grid_size(&self) -> (u32, u32) {
        (self.grid_rows, self.grid_cols)
    }

    pub fn dm(&self) -> Option<&ConnectionId> {
        self.dm.as_ref()
    }

    pub fn is_dm(&self, identity: &ConnectionId) -> bool {
        self.dm.as_ref() == Some(identity)
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, identity: &ConnectionId) -> Option<&Player> {
        self.players.iter().find(|player| &player.id == identity)
    }

    pub fn saved_patterns(&self) -> &[Pattern] {
        &self.saved_patterns
    }

    pub fn active_squares(&self) -> &[ActiveSquare] {
        &self.active_squares
    }

    pub fn background_image(&self) -> Option<&str> {
        self.background_image.as_deref()
    }

    pub fn contains_cell(&self, row: u32, col: u32) -> bool {
        row < self.grid_rows && col < self.grid_cols
    }

    /// Copies the whole session into its wire form.
    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            grid_rows: self.grid_rows,
            grid_cols: self.grid_cols,
            players: self.players.clone(),
            dm: self.dm.clone(),
            saved_patterns: self.saved_patterns.clone(),
            active_squares: self.active_squares.clone(),
            background_image: self.background_image.clone(),
        }
    }

    /// Rejects `requester` unless it holds the DM slot.
    pub fn require_dm(
        &self,
        requester: &ConnectionId,
        command: &'static str,
    ) -> Result<(), CommandError> {
        if self.is_dm(requester) {
            Ok(())
        } else {
            warn!("Unauthorized {} attempt from {}", command, requester);
            Err(CommandError::Unauthorized { command })
        }
    }

    /// Sets the grid size and hands the DM slot to `requester`.
    ///
    /// An existing DM is replaced without a check. Returns the displaced DM
    /// when it was a different connection so it can be told it lost the role.
    pub fn create_game(
        &mut self,
        requester: &ConnectionId,
        rows: u32,
        cols: u32,
    ) -> Result<Option<ConnectionId>, CommandError> {
        self.validate_grid(rows, cols)?;

        let displaced = self.dm.replace(requester.clone()).filter(|old| old != requester);
        if let Some(old) = &displaced {
            warn!("DM slot reassigned from {} to {}", old, requester);
        }

        self.grid_rows = rows;
        self.grid_cols = cols;
        self.clamp_players();

        info!("Game created by DM {} ({}x{})", requester, rows, cols);
        Ok(displaced)
    }

    /// Adds a player at the centre cell with the next palette color.
    pub fn add_player(
        &mut self,
        identity: &ConnectionId,
        name: &str,
    ) -> Result<&Player, CommandError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CommandError::malformed("player name is empty"));
        }
        if self.player(identity).is_some() {
            return Err(CommandError::invalid_state(format!(
                "{} has already joined",
                identity
            )));
        }

        let color = self.next_color();
        let player = Player::new(
            identity.clone(),
            name.to_string(),
            self.grid_rows / 2,
            self.grid_cols / 2,
            color,
        );

        info!(
            "Added player {} ({}) at ({}, {}) with color {}",
            player.name, identity, player.row, player.col, player.color
        );
        self.players.push(player);
        Ok(&self.players[self.players.len() - 1])
    }

    /// Moves a player if the target cell is on the grid and within the
    /// player's remaining movement budget. Returns the distance travelled.
    pub fn move_player(
        &mut self,
        identity: &ConnectionId,
        row: u32,
        col: u32,
    ) -> Result<u32, CommandError> {
        if !self.contains_cell(row, col) {
            return Err(CommandError::malformed(format!(
                "cell ({}, {}) is outside the {}x{} grid",
                row, col, self.grid_rows, self.grid_cols
            )));
        }

        let player = self
            .player_mut(identity)
            .ok_or_else(|| CommandError::invalid_state(format!("{} is not a player", identity)))?;

        let distance = manhattan_distance(player.position(), (row, col));
        if distance > player.speed_remaining {
            return Err(CommandError::invalid_state(format!(
                "move of {} exceeds remaining speed {}",
                distance, player.speed_remaining
            )));
        }

        player.row = row;
        player.col = col;
        player.speed_remaining -= distance;
        Ok(distance)
    }

    /// DM-only. Sets both speed and remaining budget, refilling movement.
    pub fn set_speed(
        &mut self,
        requester: &ConnectionId,
        target: &ConnectionId,
        speed: u32,
    ) -> Result<(), CommandError> {
        self.require_dm(requester, "updateSpeed")?;

        let player = self
            .player_mut(target)
            .ok_or_else(|| CommandError::invalid_state(format!("no player {}", target)))?;
        player.speed = speed;
        player.speed_remaining = speed;

        info!("Speed of {} set to {}", target, speed);
        Ok(())
    }

    /// DM-only. Players left outside the new bounds are pulled onto the
    /// nearest edge cell.
    pub fn resize_grid(
        &mut self,
        requester: &ConnectionId,
        rows: u32,
        cols: u32,
    ) -> Result<(), CommandError> {
        self.require_dm(requester, "updateGridSize")?;
        self.validate_grid(rows, cols)?;

        self.grid_rows = rows;
        self.grid_cols = cols;
        self.clamp_players();

        info!("Grid resized to {}x{}", rows, cols);
        Ok(())
    }

    pub fn set_background(
        &mut self,
        requester: &ConnectionId,
        image: String,
    ) -> Result<(), CommandError> {
        self.require_dm(requester, "updateBackground")?;
        self.background_image = Some(image);
        Ok(())
    }

    /// Only the owning player may replace its token image.
    pub fn set_token_image(
        &mut self,
        identity: &ConnectionId,
        image: String,
    ) -> Result<(), CommandError> {
        let player = self
            .player_mut(identity)
            .ok_or_else(|| CommandError::invalid_state(format!("{} is not a player", identity)))?;
        player.token_image = Some(image);
        Ok(())
    }

    /// DM-only. Every square of the pattern must lie on the current grid.
    pub fn save_pattern(
        &mut self,
        requester: &ConnectionId,
        pattern: Pattern,
    ) -> Result<(), CommandError> {
        self.require_dm(requester, "savePattern")?;

        if let Some(square) = pattern
            .squares
            .iter()
            .find(|square| !self.contains_cell(square.row, square.col))
        {
            return Err(CommandError::malformed(format!(
                "pattern square ({}, {}) is outside the grid",
                square.row, square.col
            )));
        }

        info!(
            "Pattern saved: {} ({} squares)",
            pattern.name,
            pattern.squares.len()
        );
        self.saved_patterns.push(pattern);
        Ok(())
    }

    /// DM-only. Removes the saved pattern at `index`; out of range is an error
    /// that leaves the list untouched.
    pub fn delete_pattern(
        &mut self,
        requester: &ConnectionId,
        index: i64,
    ) -> Result<Pattern, CommandError> {
        self.require_dm(requester, "deletePattern")?;

        let position = usize::try_from(index)
            .ok()
            .filter(|position| *position < self.saved_patterns.len())
            .ok_or_else(|| {
                CommandError::invalid_state(format!("no saved pattern at index {}", index))
            })?;

        let pattern = self.saved_patterns.remove(position);
        info!("Pattern deleted at index {}: {}", position, pattern.name);
        Ok(pattern)
    }

    /// Restores every player's movement budget. Returns how many needed it.
    pub fn regenerate_speed(&mut self) -> usize {
        let mut refilled = 0;
        for player in &mut self.players {
            if player.speed_remaining < player.speed {
                player.speed_remaining = player.speed;
                refilled += 1;
            }
        }
        refilled
    }

    /// Drops everything tied to a closed connection. Returns true when the
    /// roster or the DM slot changed.
    pub fn remove_connection(&mut self, identity: &ConnectionId) -> bool {
        let mut changed = false;

        if let Some(index) = self.players.iter().position(|player| &player.id == identity) {
            let player = self.players.remove(index);
            info!("Removed player {} ({})", player.name, identity);
            changed = true;
        }

        if self.is_dm(identity) {
            self.dm = None;
            info!("DM {} disconnected, DM slot is free", identity);
            changed = true;
        }

        changed
    }

    pub fn add_active_square(&mut self, square: ActiveSquare) {
        self.active_squares.push(square);
    }

    pub fn remove_active_square(&mut self, id: u64) -> Option<ActiveSquare> {
        let index = self.active_squares.iter().position(|square| square.id == id)?;
        Some(self.active_squares.remove(index))
    }

    /// Hits every player standing on the cell right now.
    pub fn sweep_hits(&mut self, row: u32, col: u32) -> Vec<ConnectionId> {
        self.players
            .iter_mut()
            .filter(|player| player.is_at(row, col))
            .map(|player| {
                player.hits += 1;
                player.id.clone()
            })
            .collect()
    }

    fn player_mut(&mut self, identity: &ConnectionId) -> Option<&mut Player> {
        self.players.iter_mut().find(|player| &player.id == identity)
    }

    fn next_color(&mut self) -> &'static str {
        let color = PLAYER_COLORS[self.color_index % PLAYER_COLORS.len()];
        self.color_index += 1;
        color
    }

    fn validate_grid(&self, rows: u32, cols: u32) -> Result<(), CommandError> {
        let max = self.limits.max_grid_size;
        if rows == 0 || cols == 0 || rows > max || cols > max {
            return Err(CommandError::malformed(format!(
                "grid size {}x{} must be between 1 and {}",
                rows, cols, max
            )));
        }
        Ok(())
    }

    fn clamp_players(&mut self) {
        let (max_row, max_col) = (self.grid_rows - 1, self.grid_cols - 1);
        for player in &mut self.players {
            if player.row > max_row || player.col > max_col {
                player.row = player.row.min(max_row);
                player.col = player.col.min(max_col);
                info!(
                    "Clamped player {} to ({}, {})",
                    player.id, player.row, player.col
                );
            }
        }
    }
}
