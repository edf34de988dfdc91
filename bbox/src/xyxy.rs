use super::Rect;
use crate::common::*;

/// Bounding box in corner form `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XYXY<T> {
    pub(crate) x1: T,
    pub(crate) y1: T,
    pub(crate) x2: T,
    pub(crate) y2: T,
}

impl<T> Rect for XYXY<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn x1(&self) -> Self::Type {
        self.x1
    }

    fn y1(&self) -> Self::Type {
        self.y1
    }

    fn x2(&self) -> Self::Type {
        self.x2
    }

    fn y2(&self) -> Self::Type {
        self.y2
    }

    fn w(&self) -> Self::Type {
        self.x2 - self.x1
    }

    fn h(&self) -> Self::Type {
        self.y2 - self.y1
    }

    fn try_from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let [x1, y1, x2, y2] = xyxy;
        ensure!(x2 >= x1 && y2 >= y1, "x2 >= x1 and y2 >= y1 must hold");
        Ok(Self { x1, y1, x2, y2 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum as _;

    #[test]
    fn inverted_corners_are_rejected() {
        assert!(XYXY::try_from_xyxy([2.0, 0.0, 1.0, 1.0]).is_err());
        assert!(XYXY::try_from_xyxy([0.0, 2.0, 1.0, 1.0]).is_err());
    }

    #[test]
    fn degenerate_box_has_zero_area() {
        let rect = XYXY::from_xyxy([3.0, 4.0, 3.0, 8.0]);
        assert_eq!(rect.w(), 0.0);
        assert_eq!(rect.area(), 0.0);
    }
}
