use super::keys::*;
use super::Metabase;
use crate::error::Result;
use crate::object::Address;

impl Metabase {
    /// Mark an object for relocation to another node
    pub fn to_move_it(&self, address: &Address) -> Result<()> {
        self.write(|db| {
            db.insert(address_key(TO_MOVE_IT, address), EMPTY)?;
            Ok(())
        })
    }

    pub fn do_not_move(&self, address: &Address) -> Result<()> {
        self.write(|db| {
            db.remove(address_key(TO_MOVE_IT, address))?;
            Ok(())
        })
    }

    /// Every address marked with [`Metabase::to_move_it`]
    pub fn movable(&self) -> Result<Vec<Address>> {
        self.read(|db| {
            db.scan_prefix([TO_MOVE_IT])
                .map(|item| {
                    let (key, _) = item?;
                    key_address(&key)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::open_metabase;
    use crate::object::{Address, ContainerId, ObjectId};

    #[test]
    fn test_move_marks() {
        let db = open_metabase();
        let a = Address::new(ContainerId::random(), ObjectId::random());
        let b = Address::new(ContainerId::random(), ObjectId::random());

        db.to_move_it(&a).unwrap();
        db.to_move_it(&b).unwrap();
        db.do_not_move(&a).unwrap();
        assert_eq!(db.movable().unwrap(), vec![b]);
    }
}
