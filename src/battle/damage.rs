//! Damage application collaborator
//!
//! Pure and QTE-agnostic: the orchestrators decide *how much* lands, this
//! module only decides how protection and HP absorb it.

use serde::{Deserialize, Serialize};

/// Which protection pool absorbs a hit first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DamageType {
    Physical,
    Magical,
}

impl DamageType {
    pub fn from_magic(is_magic: bool) -> Self {
        if is_magic {
            Self::Magical
        } else {
            Self::Physical
        }
    }
}

/// New protection/HP values after a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageApplication {
    pub new_physical_protection: i32,
    pub new_magical_protection: i32,
    pub new_hp: i32,
}

impl DamageApplication {
    pub fn is_dead(&self) -> bool {
        self.new_hp <= 0
    }
}

/// Apply `amount` damage: the matching protection pool absorbs first, the
/// remainder reduces HP. Nothing goes below zero.
pub fn apply_damage(
    physical_protection: i32,
    magical_protection: i32,
    current_hp: i32,
    amount: i32,
    damage_type: DamageType,
) -> DamageApplication {
    let amount = amount.max(0);
    let pool = match damage_type {
        DamageType::Physical => physical_protection,
        DamageType::Magical => magical_protection,
    }
    .max(0);

    let absorbed = amount.min(pool);
    let remaining_pool = pool - absorbed;
    let new_hp = (current_hp - (amount - absorbed)).max(0);

    let (new_physical_protection, new_magical_protection) = match damage_type {
        DamageType::Physical => (remaining_pool, magical_protection),
        DamageType::Magical => (physical_protection, remaining_pool),
    };

    DamageApplication {
        new_physical_protection,
        new_magical_protection,
        new_hp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_absorbs_before_hp() {
        let result = apply_damage(5, 3, 20, 8, DamageType::Physical);
        assert_eq!(
            result,
            DamageApplication {
                new_physical_protection: 0,
                new_magical_protection: 3,
                new_hp: 17,
            }
        );
    }

    #[test]
    fn magical_damage_uses_magical_pool() {
        let result = apply_damage(5, 10, 20, 4, DamageType::Magical);
        assert_eq!(result.new_magical_protection, 6);
        assert_eq!(result.new_physical_protection, 5);
        assert_eq!(result.new_hp, 20);
    }

    #[test]
    fn hp_floors_at_zero() {
        let result = apply_damage(0, 0, 5, 50, DamageType::Physical);
        assert_eq!(result.new_hp, 0);
        assert!(result.is_dead());
    }

    #[test]
    fn negative_amount_is_ignored() {
        let result = apply_damage(2, 2, 10, -7, DamageType::Magical);
        assert_eq!(result.new_hp, 10);
        assert_eq!(result.new_magical_protection, 2);
    }
}
