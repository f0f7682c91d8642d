//! In-memory cart: an insertion-ordered set of items deduped by URL.
//!
//! Failures here are soft (`ok:false` + message) rather than errors, and
//! every response echoes the full cart so clients can reconcile without a
//! follow-up call.

use serde::{Deserialize, Serialize};
use shopscout_core::CartItem;

#[derive(Debug, Clone, Deserialize)]
pub struct NewCartItem {
    pub name: String,
    pub url: String,
    pub price: f64,
    pub currency: String,
    pub source: String,
    #[serde(rename = "imageUrl", default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub cart: Vec<CartItem>,
}

#[derive(Debug, Default)]
pub struct Cart {
    items: Vec<CartItem>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    fn ok(&self) -> CartResponse {
        CartResponse {
            ok: true,
            message: None,
            cart: self.items.clone(),
        }
    }

    fn fail(&self, message: impl Into<String>) -> CartResponse {
        CartResponse {
            ok: false,
            message: Some(message.into()),
            cart: self.items.clone(),
        }
    }

    /// Add an item, assigning it a fresh id. Duplicate URLs (exact string
    /// match) are rejected without mutating the cart.
    pub fn add(&mut self, item: NewCartItem) -> CartResponse {
        if self.items.iter().any(|existing| existing.url == item.url) {
            return self.fail(format!("item with url {} is already in the cart", item.url));
        }
        self.items.push(CartItem {
            id: uuid::Uuid::new_v4().to_string(),
            name: item.name,
            url: item.url,
            price: item.price,
            currency: item.currency,
            source: item.source,
            image_url: item.image_url,
            category: item.category,
        });
        self.ok()
    }

    pub fn list(&self) -> CartResponse {
        self.ok()
    }

    pub fn remove(&mut self, id: &str) -> CartResponse {
        let Some(pos) = self.items.iter().position(|item| item.id == id) else {
            return self.fail(format!("no cart item with id {id}"));
        };
        self.items.remove(pos);
        self.ok()
    }

    pub fn clear(&mut self) -> CartResponse {
        self.items.clear();
        self.ok()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(url: &str) -> NewCartItem {
        NewCartItem {
            name: "a".to_string(),
            url: url.to_string(),
            price: 1.0,
            currency: "USD".to_string(),
            source: "s".to_string(),
            image_url: None,
            category: None,
        }
    }

    #[test]
    fn add_then_duplicate_url_is_rejected_softly() {
        let mut cart = Cart::new();
        let first = cart.add(item("u"));
        assert!(first.ok);
        assert_eq!(first.cart.len(), 1);

        let second = cart.add(item("u"));
        assert!(!second.ok);
        assert!(second.message.is_some());
        assert_eq!(second.cart.len(), 1);
        assert_eq!(cart.len(), 1);
    }

    #[test]
    fn remove_unknown_id_keeps_cart_intact() {
        let mut cart = Cart::new();
        cart.add(item("u"));
        let resp = cart.remove("nope");
        assert!(!resp.ok);
        assert_eq!(resp.cart.len(), 1);
    }

    #[test]
    fn remove_by_id_and_clear() {
        let mut cart = Cart::new();
        cart.add(item("u1"));
        cart.add(item("u2"));
        let id = cart.list().cart[0].id.clone();
        let resp = cart.remove(&id);
        assert!(resp.ok);
        assert_eq!(resp.cart.len(), 1);
        assert_eq!(resp.cart[0].url, "u2");

        let resp = cart.clear();
        assert!(resp.ok);
        assert!(resp.cart.is_empty());
    }

    #[test]
    fn insertion_order_is_preserved_and_ids_are_unique() {
        let mut cart = Cart::new();
        for i in 0..5 {
            cart.add(item(&format!("u{i}")));
        }
        let listed = cart.list().cart;
        let urls: Vec<&str> = listed.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["u0", "u1", "u2", "u3", "u4"]);
        let mut ids: Vec<&str> = listed.iter().map(|i| i.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
