//! Recipe collaborator.
//!
//! Recipes live in another module of the admin application; this core only
//! reads the pricing surface it needs to build order items. The invariant
//! enforced here: a recipe-linked item's unit price always equals the price
//! implied by its pricing mode. Manual items price freely.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{OrderItem, PricingMode};

/// The slice of a recipe this core consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "pricePerPortion")]
    pub price_per_portion: f64,
    #[serde(default, alias = "pricePerPiece")]
    pub price_per_piece: f64,
}

impl RecipeRef {
    pub fn price_for(&self, mode: PricingMode) -> f64 {
        match mode {
            PricingMode::PerPortion => self.price_per_portion,
            PricingMode::PerPiece => self.price_per_piece,
        }
    }
}

/// Read-only recipe lookup, owned by the recipe module.
#[async_trait]
pub trait RecipeSource: Send + Sync {
    async fn recipe(&self, user_id: &str, recipe_id: &str)
        -> Result<Option<RecipeRef>, StoreError>;
}

/// Build an order item from a recipe at the given quantity and pricing
/// mode. The item is locked to recipe pricing (`is_from_recipe`).
pub fn order_item_from_recipe(recipe: &RecipeRef, quantity: u32, mode: PricingMode) -> OrderItem {
    let unit_price = recipe.price_for(mode);
    let mut item = OrderItem {
        id: Uuid::new_v4().to_string(),
        name: recipe.name.clone(),
        quantity,
        unit: None,
        unit_price,
        total: 0.0,
        recipe_id: Some(recipe.id.clone()),
        recipe_category: recipe.category.clone(),
        is_from_recipe: true,
        pricing_mode: Some(mode),
        price_per_portion: Some(recipe.price_per_portion),
        price_per_piece: Some(recipe.price_per_piece),
    };
    item.recompute_total();
    item
}

/// Switch a recipe-linked item to the other pricing mode, re-deriving unit
/// price and total. Returns `false` (and changes nothing) for manual items
/// or items missing the alternate price.
pub fn reprice_for_mode(item: &mut OrderItem, mode: PricingMode) -> bool {
    if !item.is_from_recipe {
        return false;
    }
    let price = match mode {
        PricingMode::PerPortion => item.price_per_portion,
        PricingMode::PerPiece => item.price_per_piece,
    };
    let Some(price) = price else {
        return false;
    };
    item.pricing_mode = Some(mode);
    item.unit_price = price;
    item.recompute_total();
    true
}

// ===========================================================================
// Tests
// ===========================================================================
