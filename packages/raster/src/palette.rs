//! Exact state ⇄ colour codec.

use cleanup_map_geo_models::PointState;

/// An RGBA pixel.
pub type Rgba = [u8; 4];

/// Errors from building a [`Palette`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaletteError {
    /// A visible state was given a fully transparent colour.
    #[error("Colour for {state} must not be fully transparent")]
    Transparent {
        /// The state with the transparent colour.
        state: PointState,
    },

    /// Both visible states share the same colour.
    #[error("Clear and muddy colours must differ (both {color:?})")]
    Ambiguous {
        /// The shared colour.
        color: Rgba,
    },
}

/// Bidirectional mapping between point states and pixel colours.
///
/// [`PointState::Undefined`] is always fully transparent. Decoding is exact:
/// a pixel maps back to a state only if all four channels match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    clear: Rgba,
    muddy: Rgba,
}

impl Palette {
    /// Colour of [`PointState::Undefined`].
    pub const TRANSPARENT: Rgba = [0, 0, 0, 0];

    /// Default colour for cleared points (semi-transparent green).
    pub const DEFAULT_CLEAR: Rgba = [0, 255, 0, 120];

    /// Default colour for muddy points (brown).
    pub const DEFAULT_MUDDY: Rgba = [139, 69, 19, 200];

    /// Creates a palette.
    ///
    /// # Errors
    ///
    /// * [`PaletteError::Transparent`] if either colour has zero alpha
    /// * [`PaletteError::Ambiguous`] if both colours are equal
    pub fn new(clear: Rgba, muddy: Rgba) -> Result<Self, PaletteError> {
        if clear[3] == 0 {
            return Err(PaletteError::Transparent {
                state: PointState::Clear,
            });
        }
        if muddy[3] == 0 {
            return Err(PaletteError::Transparent {
                state: PointState::Muddy,
            });
        }
        if clear == muddy {
            return Err(PaletteError::Ambiguous { color: clear });
        }
        Ok(Self { clear, muddy })
    }

    /// Returns the colour a state is painted with.
    #[must_use]
    pub const fn color_for(&self, state: PointState) -> Rgba {
        match state {
            PointState::Clear => self.clear,
            PointState::Muddy => self.muddy,
            PointState::Undefined => Self::TRANSPARENT,
        }
    }

    /// Returns the state a colour encodes, or `None` for colours this
    /// palette never produces.
    #[must_use]
    pub fn state_for(&self, rgba: Rgba) -> Option<PointState> {
        if rgba == self.clear {
            Some(PointState::Clear)
        } else if rgba == self.muddy {
            Some(PointState::Muddy)
        } else if rgba == Self::TRANSPARENT {
            Some(PointState::Undefined)
        } else {
            None
        }
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            clear: Self::DEFAULT_CLEAR,
            muddy: Self::DEFAULT_MUDDY,
        }
    }
}
