use std::fmt::{Display, Formatter};

/// The two traffic directions crossing the tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    LeftToRight,
    RightToLeft,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::LeftToRight, Direction::RightToLeft];

    /// The direction in which replies to this direction's frames travel
    pub fn reverse(self) -> Self {
        match self {
            Direction::LeftToRight => Direction::RightToLeft,
            Direction::RightToLeft => Direction::LeftToRight,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::LeftToRight => "left-to-right",
            Direction::RightToLeft => "right-to-left",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value that exists once per traffic direction
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PerDirection<T> {
    pub left_to_right: T,
    pub right_to_left: T,
}

impl<T> PerDirection<T> {
    pub fn new(left_to_right: T, right_to_left: T) -> Self {
        Self {
            left_to_right,
            right_to_left,
        }
    }

    pub fn get(&self, direction: Direction) -> &T {
        match direction {
            Direction::LeftToRight => &self.left_to_right,
            Direction::RightToLeft => &self.right_to_left,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::LeftToRight => &mut self.left_to_right,
            Direction::RightToLeft => &mut self.right_to_left,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(Direction, T) -> U) -> PerDirection<U> {
        PerDirection {
            left_to_right: f(Direction::LeftToRight, self.left_to_right),
            right_to_left: f(Direction::RightToLeft, self.right_to_left),
        }
    }

    /// Builds a value for each direction
    pub fn from_fn(mut f: impl FnMut(Direction) -> T) -> Self {
        Self {
            left_to_right: f(Direction::LeftToRight),
            right_to_left: f(Direction::RightToLeft),
        }
    }
}
