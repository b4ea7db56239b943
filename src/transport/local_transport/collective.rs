use crate::error::{DartError, DartResult};
use crate::transport::{CollGroup, CommAm, CommCollective};

use super::LocalComm;

impl CommCollective for LocalComm {
    #[tracing::instrument(skip_all, level = "debug")]
    fn allgather(&self, group: &CollGroup, data: &[u8]) -> DartResult<Vec<Vec<u8>>> {
        if group.members.get(group.my_index) != Some(&self.my_unit) {
            return Err(DartError::Inval);
        }
        let seq = {
            let mut seqs = self.coll_seq.lock();
            let seq = seqs.entry(group.key).or_insert(0);
            *seq += 1;
            *seq
        };
        tracing::trace!(
            "unit {} collective key {:x} seq {} members {:?}",
            self.my_unit,
            group.key,
            seq,
            group.members
        );
        self.fabric
            .rendezvous((group.key, seq), group.size(), group.my_index, data, || {
                self.progress();
            })
            .ok_or(DartError::Other)
    }
}
