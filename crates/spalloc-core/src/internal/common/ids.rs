use crate::define_id_type;

define_id_type!(JobId, u32);
define_id_type!(AllocationId, u32);
